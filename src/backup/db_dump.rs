// sitebackup/src/backup/db_dump.rs
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::config::DatabaseConfig;
use crate::utils::command::Invocation;

/// Where the dump of `database` lands inside the staging tree.
pub fn dump_file_path(database_dir: &Path, db: &DatabaseConfig) -> PathBuf {
    database_dir.join(format!("{}.sql", db.database))
}

/// Dumps the configured database on the database host, streaming the SQL back
/// over SSH into `dump_file`.
///
/// The password travels as its own argument word; the SSH transport quotes it,
/// so no manual escaping happens here.
pub fn dump_invocation(db: &DatabaseConfig, dump_file: &Path) -> Invocation {
    let args: Vec<OsString> = vec![
        OsString::from("-u"),
        OsString::from(&db.db_username),
        OsString::from(format!("--password={}", db.password.expose())),
        OsString::from(&db.database),
    ];
    Invocation::remote(db.ssh.clone(), db.dump_command.clone(), args).with_stdout(dump_file)
}
