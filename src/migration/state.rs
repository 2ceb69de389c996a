use std::fmt;

use serde::{Deserialize, Serialize};

/// Progress of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    #[default]
    NotStarted,
    BackupCreated,
    RecordsMigrated,
    FilesMigrated,
    Verified,
    Done,
    Failed,
}

impl MigrationState {
    fn rank(self) -> Option<u8> {
        match self {
            MigrationState::NotStarted => Some(0),
            MigrationState::BackupCreated => Some(1),
            MigrationState::RecordsMigrated => Some(2),
            MigrationState::FilesMigrated => Some(3),
            MigrationState::Verified => Some(4),
            MigrationState::Done => Some(5),
            MigrationState::Failed => None,
        }
    }

    /// State after `step` completed successfully.
    ///
    /// Progress never moves backwards: re-running an earlier step keeps the
    /// furthest state reached. A successful step clears `Failed`.
    pub fn after(self, step: MigrationState) -> MigrationState {
        match (self.rank(), step.rank()) {
            (_, None) => MigrationState::Failed,
            (None, Some(_)) => step,
            (Some(current), Some(next)) if next > current => step,
            _ => self,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == MigrationState::Done
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationState::NotStarted => "NOT_STARTED",
            MigrationState::BackupCreated => "BACKUP_CREATED",
            MigrationState::RecordsMigrated => "RECORDS_MIGRATED",
            MigrationState::FilesMigrated => "FILES_MIGRATED",
            MigrationState::Verified => "VERIFIED",
            MigrationState::Done => "DONE",
            MigrationState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_advance_in_order() {
        let state = MigrationState::NotStarted
            .after(MigrationState::BackupCreated)
            .after(MigrationState::RecordsMigrated)
            .after(MigrationState::FilesMigrated)
            .after(MigrationState::Verified)
            .after(MigrationState::Done);
        assert_eq!(state, MigrationState::Done);
        assert!(state.is_terminal());
    }

    #[test]
    fn rerunning_an_earlier_step_keeps_progress() {
        let state = MigrationState::FilesMigrated.after(MigrationState::RecordsMigrated);
        assert_eq!(state, MigrationState::FilesMigrated);
    }

    #[test]
    fn failed_is_reachable_from_anywhere() {
        for state in [
            MigrationState::NotStarted,
            MigrationState::BackupCreated,
            MigrationState::Verified,
            MigrationState::Done,
        ] {
            assert_eq!(state.after(MigrationState::Failed), MigrationState::Failed);
        }
    }

    #[test]
    fn success_after_failure_resumes() {
        let state = MigrationState::Failed.after(MigrationState::BackupCreated);
        assert_eq!(state, MigrationState::BackupCreated);
    }

    #[test]
    fn serializes_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&MigrationState::RecordsMigrated).unwrap(),
            "\"RECORDS_MIGRATED\""
        );
        assert_eq!(MigrationState::NotStarted.to_string(), "NOT_STARTED");
    }
}
