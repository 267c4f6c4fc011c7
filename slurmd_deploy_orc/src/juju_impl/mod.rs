// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

//! Platform client driving a Juju controller through the `juju` and
//! `charmcraft` command-line tools.

pub mod cli;
pub mod parse;


pub use cli::JujuPlatform;
