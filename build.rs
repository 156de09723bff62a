// Copyright © 2026 The Fileapi Quota Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::process::Command;

fn main() {
    let mut version = String::from(env!("CARGO_PKG_VERSION"));

    if let Ok(git_out) = Command::new("git").args(["describe", "--dirty"]).output() {
        if git_out.status.success() {
            if let Ok(git_version) = String::from_utf8(git_out.stdout) {
                let git_version = git_version.trim();
                if !git_version.is_empty() {
                    version = git_version.to_string();
                }
            }
        }
    }

    // Sets BUILT_VERSION for src/main.rs to report the exact version.
    println!("cargo:rustc-env=BUILT_VERSION={version}");
}
