// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local databases have to be dumped and moved by hand.

use super::{probe, Check};
use crate::instance::{CheckName, Finding};
use crate::transport::{CommandOptions, Transport, TransportError};
use async_trait::async_trait;

pub const NAME: CheckName = CheckName::new("database-usage");

pub const INSTALLED_COMMAND: &str =
    "command -v mysqld || test -x /usr/sbin/mysqld";
pub const RUNNING_COMMAND: &str = "pgrep -x mysqld";
pub const LIST_COMMAND: &str =
    "mysql --defaults-file=/etc/mysql/debian.cnf -N -B -e 'SHOW DATABASES'";

/// Databases every server has; these don't need migrating.
const SYSTEM_DATABASES: &[&str] =
    &["information_schema", "performance_schema", "mysql", "sys"];

pub struct DatabaseUsage;

fn classify_databases(listing: &str) -> Finding {
    let user: Vec<&str> = listing
        .lines()
        .map(str::trim)
        .filter(|db| !db.is_empty() && !SYSTEM_DATABASES.contains(db))
        .collect();
    if user.is_empty() {
        Finding::pass("database server is running but holds no databases")
    } else {
        Finding::warning(format!(
            "database server holds {} database(s) that must be migrated by \
             hand: {}",
            user.len(),
            user.join(", ")
        ))
    }
}

#[async_trait]
impl Check for DatabaseUsage {
    fn name(&self) -> CheckName {
        NAME
    }

    async fn run(
        &self,
        host: &str,
        transport: &dyn Transport,
    ) -> Result<Finding, TransportError> {
        let installed =
            probe(transport, host, INSTALLED_COMMAND, CommandOptions::PLAIN)
                .await?;
        if installed.is_err() {
            return Ok(Finding::pass("no database server installed"));
        }

        let running =
            probe(transport, host, RUNNING_COMMAND, CommandOptions::PLAIN)
                .await?;
        if running.is_err() {
            return Ok(Finding::warning(
                "database server is installed but not running; \
                 cannot tell whether it holds data",
            ));
        }

        let listing =
            probe(transport, host, LIST_COMMAND, CommandOptions::ELEVATED)
                .await?;
        // A refused login here means we cannot verify, not that the host is
        // gone.
        Ok(listing
            .map(|listing| classify_databases(&listing))
            .unwrap_or_else(Finding::from))
    }
}
