// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Files kept in the local home directory won't survive the move; they
//! belong under /data/project/.

use super::{probe, Check};
use crate::instance::{CheckName, Finding};
use crate::transport::{CommandOptions, Transport, TransportError};
use async_trait::async_trait;

pub const NAME: CheckName = CheckName::new("local-storage-in-home");

/// Lists the home directory one entry per line; fails if it is missing.
pub const COMMAND: &str = "ls -A \"$HOME\"";

pub struct LocalStorageInHome;

fn classify(listing: &str) -> Finding {
    match listing.lines().filter(|entry| !entry.trim().is_empty()).count() {
        0 => Finding::pass("not using the home folder for storing files"),
        n => Finding::fail(format!(
            "{} entries in the home folder; please migrate your files to \
             /data/project/",
            n
        )),
    }
}

#[async_trait]
impl Check for LocalStorageInHome {
    fn name(&self) -> CheckName {
        NAME
    }

    async fn run(
        &self,
        host: &str,
        transport: &dyn Transport,
    ) -> Result<Finding, TransportError> {
        let output =
            probe(transport, host, COMMAND, CommandOptions::PLAIN).await?;
        Ok(output.map(|o| classify(&o)).unwrap_or_else(Finding::from))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::instance::CheckOutcome;

    #[test]
    fn test_classify() {
        assert_eq!(classify("").outcome, CheckOutcome::Pass);
        assert_eq!(classify("\n").outcome, CheckOutcome::Pass);
        let finding = classify(".bashrc\nnotes.txt\ndumps\n");
        assert_eq!(finding.outcome, CheckOutcome::Fail);
        assert!(finding.detail.starts_with("3 entries"));
    }
}
