// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for the command-line entry point.

use std::process::exit;

/// Represents a fatal error in a command-line program.
#[derive(Debug)]
pub enum CmdError {
    /// Incorrect command-line arguments
    Usage(String),
    /// Everything else
    Failure(anyhow::Error),
}

impl CmdError {
    pub fn exit_status(&self) -> i32 {
        match self {
            CmdError::Usage(_) => 2,
            CmdError::Failure(_) => 1,
        }
    }
}

/// Exits the current process on a fatal error.
pub fn fatal(cmd_error: CmdError) -> ! {
    let arg0 = std::env::args()
        .next()
        .unwrap_or_else(|| String::from("migration-assistant"));
    let exit_code = cmd_error.exit_status();
    let message = match cmd_error {
        CmdError::Usage(m) => m,
        CmdError::Failure(e) => format!("{:#}", e),
    };
    eprintln!("{}: {}", arg0, message);
    exit(exit_code);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_exit_status() {
        assert_eq!(CmdError::Usage("bad flag".to_string()).exit_status(), 2);
        assert_eq!(
            CmdError::Failure(anyhow::anyhow!("boom")).exit_status(),
            1
        );
    }
}
