// sitebackup/src/backup/mod.rs
pub(crate) mod archive; // tarball creation
pub(crate) mod chunker; // archive splitting and the chunk manifest
pub(crate) mod db_dump; // remote database dump
pub(crate) mod logic; // run controller
pub(crate) mod resume; // resumable chunk upload
pub(crate) mod s3_upload; // object store client
pub(crate) mod site_sync; // code/asset sync and the maintenance flag
pub(crate) mod stages; // stage sequencer

use chrono::{Local, NaiveDate};
use std::path::{Path, PathBuf};

use crate::config::AppConfig;
use crate::errors::Result;
use crate::utils::command::SshRunner;
use logic::{RunController, RunOutcome};
use s3_upload::S3ObjectStore;
use stages::{Stage, StageAction, StageKind};

pub const LOG_FILE: &str = "backup.log";
const STAGING_DIR: &str = "staging";
const CHUNK_DIR: &str = "chunks";

/// `<site>_backup_<year>-<month>-<day>`, month and day without zero padding.
pub fn backup_name(site_name: &str, date: NaiveDate) -> String {
    format!("{}_backup_{}", site_name, date.format("%Y-%-m-%-d"))
}

/// Everything one run needs to know: where its files live, where they go,
/// and which stages produce them.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub name: String,
    pub output_dir: PathBuf,
    pub bucket: String,
    pub acl: String,
    pub chunk_size: u64,
    pub cleanup: bool,
    pub stages: Vec<Stage>,
}

impl BackupJob {
    /// Lays out the run for `date` under `output_root/<backup name>`.
    pub fn new(config: &AppConfig, date: NaiveDate) -> Self {
        let name = backup_name(&config.site_name, date);
        let output_dir = config.output_root.join(&name);
        let stages = build_stages(config, &name, &output_dir);
        BackupJob {
            name,
            output_dir,
            bucket: config.spaces_config.bucket_name.clone(),
            acl: config.spaces_config.acl.clone(),
            chunk_size: config.chunk_size_bytes,
            cleanup: config.cleanup,
            stages,
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.output_dir.join(LOG_FILE)
    }

    pub fn staging_dir(&self) -> PathBuf {
        staging_dir(&self.output_dir)
    }

    pub fn archive_path(&self) -> PathBuf {
        archive_path(&self.output_dir, &self.name)
    }

    pub fn chunk_dir(&self) -> PathBuf {
        self.output_dir.join(CHUNK_DIR)
    }

    /// Directories the staging stages write into.
    pub fn staging_subdirs(&self) -> [PathBuf; 3] {
        let staging = self.staging_dir();
        [staging.join("code"), staging.join("assets"), staging.join("database")]
    }
}

fn staging_dir(output_dir: &Path) -> PathBuf {
    output_dir.join(STAGING_DIR)
}

fn archive_path(output_dir: &Path, name: &str) -> PathBuf {
    output_dir.join(format!("{}.tgz", name))
}

fn build_stages(config: &AppConfig, name: &str, output_dir: &Path) -> Vec<Stage> {
    let staging = staging_dir(output_dir);
    let code_dir = staging.join("code");
    let assets_dir = staging.join("assets");
    let dump_file = db_dump::dump_file_path(&staging.join("database"), &config.database);
    let web = &config.webserver;
    let transport = &config.transport;

    vec![
        Stage::required(
            StageKind::CodeSync,
            "backing up application code",
            StageAction::Run(site_sync::code_sync_invocation(transport, web, &code_dir)),
        ),
        Stage::required(
            StageKind::AssetSync,
            "backing up uploaded assets",
            StageAction::Run(site_sync::asset_sync_invocation(transport, web, &assets_dir)),
        ),
        Stage::optional(
            StageKind::MaintenanceOn,
            "putting up maintenance notice",
            StageAction::Run(site_sync::maintenance_on_invocation(web)),
            web.maintenance_flag,
        ),
        Stage::required(
            StageKind::DatabaseDump,
            "backing up database",
            StageAction::Run(db_dump::dump_invocation(&config.database, &dump_file)),
        ),
        Stage::optional(
            StageKind::MaintenanceOff,
            "removing maintenance notice",
            StageAction::Run(site_sync::maintenance_off_invocation(web)),
            web.maintenance_flag,
        ),
        Stage::optional(
            StageKind::PathExclusion,
            "removing excluded paths",
            StageAction::Run(site_sync::exclusion_invocation(&code_dir, &config.exclude_paths)),
            !config.exclude_paths.is_empty(),
        ),
        Stage::required(
            StageKind::Compression,
            "compressing backup",
            StageAction::Compress {
                source: staging.clone(),
                root_name: name.to_string(),
                archive: archive_path(output_dir, name),
            },
        ),
        Stage::required(
            StageKind::Chunking,
            "splitting archive into chunks",
            StageAction::Chunk {
                archive: archive_path(output_dir, name),
                chunk_dir: output_dir.join(CHUNK_DIR),
                chunk_size: config.chunk_size_bytes,
            },
        ),
    ]
}

/// Public entry point for the backup process.
pub async fn run_backup_flow(app_config: &AppConfig) -> Result<RunOutcome> {
    let job = BackupJob::new(app_config, Local::now().date_naive());
    let runner = SshRunner::with_process_runner(
        app_config.transport.ssh_bin.clone(),
        app_config.transport.batch_mode,
    );
    let store = S3ObjectStore::from_config(&app_config.spaces_config).await;
    RunController::new(runner, store).run(&job).await
}
