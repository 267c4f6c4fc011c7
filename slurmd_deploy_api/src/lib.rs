// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT
pub mod action;
pub mod error;
pub mod platform;
pub mod relation;
pub mod service;
pub mod status;
pub mod util;
