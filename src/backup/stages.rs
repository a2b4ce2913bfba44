// sitebackup/src/backup/stages.rs
use std::fs;
use std::path::PathBuf;
use tracing::{error, info};

use crate::backup::archive::create_tar_gz_archive;
use crate::backup::chunker::chunk_archive;
use crate::errors::{AppError, Result};
use crate::utils::command::{CommandRunner, Invocation, RunLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    CodeSync,
    AssetSync,
    MaintenanceOn,
    DatabaseDump,
    MaintenanceOff,
    PathExclusion,
    Compression,
    Chunking,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageAction {
    /// A process, local or remote, executed through the [`CommandRunner`].
    Run(Invocation),
    /// Archives `source` into `archive`, then deletes `source`.
    Compress {
        source: PathBuf,
        root_name: String,
        archive: PathBuf,
    },
    Chunk {
        archive: PathBuf,
        chunk_dir: PathBuf,
        chunk_size: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub kind: StageKind,
    pub label: String,
    pub action: StageAction,
    /// Optional stages are disabled by configuration and then skipped.
    pub enabled: bool,
}

impl Stage {
    pub fn required(kind: StageKind, label: impl Into<String>, action: StageAction) -> Self {
        Stage {
            kind,
            label: label.into(),
            action,
            enabled: true,
        }
    }

    pub fn optional(
        kind: StageKind,
        label: impl Into<String>,
        action: StageAction,
        enabled: bool,
    ) -> Self {
        Stage {
            enabled,
            ..Self::required(kind, label, action)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Pending,
    Running(usize),
    Succeeded,
    Failed(usize),
}

/// Runs stages in order and stops at the first failure.
pub struct StageSequencer<'a, R: CommandRunner> {
    runner: &'a R,
    log: &'a RunLog,
    state: SequencerState,
}

impl<'a, R: CommandRunner> StageSequencer<'a, R> {
    pub fn new(runner: &'a R, log: &'a RunLog) -> Self {
        StageSequencer {
            runner,
            log,
            state: SequencerState::Pending,
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn run(&mut self, stages: &[Stage]) -> Result<()> {
        for (index, stage) in stages.iter().enumerate() {
            if !stage.enabled {
                info!("   - skipping {} (disabled)", stage.label);
                continue;
            }

            self.state = SequencerState::Running(index);
            info!("   - {}...", stage.label);
            if let Err(source) = self.execute(stage) {
                self.state = SequencerState::Failed(index);
                // Best effort: the run is already failing.
                let _ = self.log.note(&format!("stage failed: {}: {}", stage.label, source));
                error!(
                    "Couldn't finish '{}'. Details in {}",
                    stage.label,
                    self.log.path().display()
                );
                return Err(AppError::Stage {
                    stage: stage.label.clone(),
                    log: self.log.path().to_path_buf(),
                    source: Box::new(source),
                });
            }
            info!("     done: {}", stage.label);
        }
        self.state = SequencerState::Succeeded;
        Ok(())
    }

    fn execute(&self, stage: &Stage) -> Result<()> {
        self.log.note(&format!("stage: {}", stage.label))?;

        match &stage.action {
            StageAction::Run(invocation) => Ok(self.runner.run(invocation, self.log)?),
            StageAction::Compress {
                source,
                root_name,
                archive,
            } => {
                create_tar_gz_archive(source, root_name, archive)?;
                fs::remove_dir_all(source).map_err(|e| AppError::io(source, e))
            }
            StageAction::Chunk {
                archive,
                chunk_dir,
                chunk_size,
            } => chunk_archive(archive, chunk_dir, *chunk_size).map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CommandError;
    use crate::test_support::RecordingRunner;
    use tempfile::TempDir;

    fn command_stage(kind: StageKind, program: &str) -> Stage {
        Stage::required(
            kind,
            format!("running {}", program),
            StageAction::Run(Invocation::local(program, Vec::<String>::new())),
        )
    }

    fn pipeline() -> Vec<Stage> {
        vec![
            command_stage(StageKind::CodeSync, "code"),
            command_stage(StageKind::AssetSync, "assets"),
            command_stage(StageKind::DatabaseDump, "dump"),
            command_stage(StageKind::MaintenanceOff, "unflag"),
        ]
    }

    fn programs(runner: &RecordingRunner) -> Vec<String> {
        runner.invocations().into_iter().map(|i| i.program).collect()
    }

    #[test]
    fn runs_all_stages_in_order() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::open(&dir.path().join("backup.log")).unwrap();
        let runner = RecordingRunner::new();
        let mut sequencer = StageSequencer::new(&runner, &log);
        assert_eq!(sequencer.state(), SequencerState::Pending);

        sequencer.run(&pipeline()).unwrap();

        assert_eq!(sequencer.state(), SequencerState::Succeeded);
        assert_eq!(programs(&runner), vec!["code", "assets", "dump", "unflag"]);
        let log_text = fs::read_to_string(log.path()).unwrap();
        assert!(log_text.contains("stage: running dump"));
    }

    #[test]
    fn never_runs_a_stage_after_a_failure() {
        for failing in ["code", "assets", "dump", "unflag"] {
            let dir = TempDir::new().unwrap();
            let log = RunLog::open(&dir.path().join("backup.log")).unwrap();
            let runner = RecordingRunner::new();
            runner.fail_program(failing);
            let mut sequencer = StageSequencer::new(&runner, &log);

            let err = sequencer.run(&pipeline()).unwrap_err();

            let stages = pipeline();
            let failed_at = stages
                .iter()
                .position(|s| s.label == format!("running {}", failing))
                .unwrap();
            assert_eq!(sequencer.state(), SequencerState::Failed(failed_at));
            let ran = programs(&runner);
            assert_eq!(ran.len(), failed_at + 1);
            assert_eq!(ran.last().map(String::as_str), Some(failing));
            match err {
                AppError::Stage { stage, log: log_path, source } => {
                    assert_eq!(stage, format!("running {}", failing));
                    assert_eq!(log_path, log.path());
                    assert!(matches!(*source, AppError::Command(CommandError::Exit { .. })));
                }
                other => panic!("expected stage error, got {:?}", other),
            }
        }
    }

    #[test]
    fn disabled_stages_are_skipped() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::open(&dir.path().join("backup.log")).unwrap();
        let runner = RecordingRunner::new();
        let stages = vec![
            command_stage(StageKind::CodeSync, "code"),
            Stage::optional(
                StageKind::MaintenanceOn,
                "putting up maintenance notice",
                StageAction::Run(Invocation::local("flag", Vec::<String>::new())),
                false,
            ),
            command_stage(StageKind::DatabaseDump, "dump"),
        ];

        StageSequencer::new(&runner, &log).run(&stages).unwrap();
        assert_eq!(programs(&runner), vec!["code", "dump"]);
    }

    #[test]
    fn compression_and_chunking_stages_produce_chunks() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::open(&dir.path().join("backup.log")).unwrap();
        let staging = dir.path().join("staging");
        fs::create_dir_all(staging.join("database")).unwrap();
        fs::write(staging.join("database/shop.sql"), vec![b'x'; 4096]).unwrap();
        let archive = dir.path().join("shop.tgz");
        let chunk_dir = dir.path().join("chunks");

        let stages = vec![
            Stage::required(
                StageKind::Compression,
                "compressing backup",
                StageAction::Compress {
                    source: staging.clone(),
                    root_name: "shop".to_string(),
                    archive: archive.clone(),
                },
            ),
            Stage::required(
                StageKind::Chunking,
                "splitting archive",
                StageAction::Chunk {
                    archive: archive.clone(),
                    chunk_dir: chunk_dir.clone(),
                    chunk_size: 64,
                },
            ),
        ];
        let runner = RecordingRunner::new();
        StageSequencer::new(&runner, &log).run(&stages).unwrap();

        assert!(!staging.exists(), "staged tree is removed after compression");
        assert!(!archive.exists(), "archive is removed after chunking");
        assert!(crate::backup::chunker::ChunkManifest::is_complete(&chunk_dir));
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn native_stage_failures_name_the_stage() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::open(&dir.path().join("backup.log")).unwrap();
        let archive = dir.path().join("shop.tgz");
        let stages = vec![
            Stage::required(
                StageKind::Compression,
                "compressing backup",
                StageAction::Compress {
                    source: dir.path().join("no-staging-here"),
                    root_name: "shop".to_string(),
                    archive: archive.clone(),
                },
            ),
            Stage::required(
                StageKind::Chunking,
                "splitting archive",
                StageAction::Chunk {
                    archive,
                    chunk_dir: dir.path().join("chunks"),
                    chunk_size: 64,
                },
            ),
        ];
        let runner = RecordingRunner::new();
        let mut sequencer = StageSequencer::new(&runner, &log);

        let err = sequencer.run(&stages).unwrap_err();

        assert_eq!(sequencer.state(), SequencerState::Failed(0));
        let message = err.to_string();
        assert!(message.contains("compressing backup"), "{}", message);
        assert!(message.contains(&log.path().display().to_string()), "{}", message);
        match err {
            AppError::Stage { stage, source, .. } => {
                assert_eq!(stage, "compressing backup");
                assert!(matches!(*source, AppError::Compression(_)));
            }
            other => panic!("expected stage error, got {:?}", other),
        }

        // A chunking failure reads the same way.
        let err = StageSequencer::new(&runner, &log)
            .run(&stages[1..])
            .unwrap_err();
        assert!(matches!(err, AppError::Stage { ref stage, .. } if stage == "splitting archive"));
    }
}
