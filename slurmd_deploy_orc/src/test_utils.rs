// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
