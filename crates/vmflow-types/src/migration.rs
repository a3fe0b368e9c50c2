//! Migration planning types
//!
//! A migration moves an instance's disks to another host. The direction
//! (shrink vs grow-or-equal) is a pure function of the source and
//! destination root disk sizes, and both directions are normalized to
//! the same phase count so reported progress percentages stay
//! comparable regardless of direction.

use serde::{Deserialize, Serialize};

/// Both migration directions report exactly this many phases.
pub const MIGRATION_TOTAL_PHASES: u32 = 5;

/// Which transfer strategy a migration uses
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationDirection {
    /// Destination root disk is smaller; the disk is copied down to the
    /// new size with the guest off, then transferred whole.
    Shrink,
    /// Destination root disk is the same size or larger; ancestor
    /// layers stream while the guest stays up, the leaf goes last.
    GrowOrEqual,
}

impl MigrationDirection {
    /// Pure function of the two root disk sizes.
    pub fn for_sizes(source_gb: u64, dest_gb: u64) -> Self {
        if dest_gb < source_gb {
            MigrationDirection::Shrink
        } else {
            MigrationDirection::GrowOrEqual
        }
    }
}

/// One unit of migration progress.
///
/// `sequence` is the position the block-transfer primitive uses to
/// identify a disk within a copy-on-write chain: 0 is the mutable leaf,
/// higher numbers are immutable ancestors, oldest last.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskTransferPhase {
    pub index: u32,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u32>,
}

impl DiskTransferPhase {
    fn new(index: u32, description: &str, sequence: Option<u32>) -> Self {
        Self {
            index,
            description: description.to_string(),
            sequence,
        }
    }
}

/// The plan for one migration call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationPlan {
    pub source_gb: u64,
    pub dest_gb: u64,
    pub direction: MigrationDirection,
    pub phases: Vec<DiskTransferPhase>,
}

impl MigrationPlan {
    /// Build the phase plan for the given sizes.
    ///
    /// Both directions produce `MIGRATION_TOTAL_PHASES` phases. The
    /// final phase is always completed by the destination host, and the
    /// shrink path keeps a leading placeholder so its percentages line
    /// up with the grow path.
    pub fn new(source_gb: u64, dest_gb: u64) -> Self {
        let direction = MigrationDirection::for_sizes(source_gb, dest_gb);
        let phases = match direction {
            MigrationDirection::Shrink => vec![
                DiskTransferPhase::new(1, "align with grow-path phase count", None),
                DiskTransferPhase::new(2, "rename source VM and power it down", None),
                DiskTransferPhase::new(3, "duplicate root disk at reduced size", None),
                DiskTransferPhase::new(4, "transfer resized disk", Some(0)),
                DiskTransferPhase::new(5, "destination-side completion", None),
            ],
            MigrationDirection::GrowOrEqual => vec![
                DiskTransferPhase::new(1, "rename source VM and snapshot disk chain", None),
                DiskTransferPhase::new(2, "transfer immutable ancestor layers", Some(1)),
                DiskTransferPhase::new(3, "power down source", None),
                DiskTransferPhase::new(4, "transfer mutable leaf layer", Some(0)),
                DiskTransferPhase::new(5, "destination-side completion", None),
            ],
        };
        Self {
            source_gb,
            dest_gb,
            direction,
            phases,
        }
    }

    pub fn total_phases(&self) -> u32 {
        MIGRATION_TOTAL_PHASES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_is_pure_function_of_sizes() {
        assert_eq!(
            MigrationDirection::for_sizes(20, 10),
            MigrationDirection::Shrink
        );
        assert_eq!(
            MigrationDirection::for_sizes(10, 20),
            MigrationDirection::GrowOrEqual
        );
        assert_eq!(
            MigrationDirection::for_sizes(10, 10),
            MigrationDirection::GrowOrEqual
        );
    }

    #[test]
    fn test_both_directions_report_five_phases() {
        let shrink = MigrationPlan::new(20, 10);
        let grow = MigrationPlan::new(10, 20);

        assert_eq!(shrink.direction, MigrationDirection::Shrink);
        assert_eq!(grow.direction, MigrationDirection::GrowOrEqual);
        assert_eq!(shrink.phases.len() as u32, MIGRATION_TOTAL_PHASES);
        assert_eq!(grow.phases.len() as u32, MIGRATION_TOTAL_PHASES);
        assert_eq!(shrink.total_phases(), grow.total_phases());
    }

    #[test]
    fn test_leaf_transfers_use_sequence_zero() {
        let shrink = MigrationPlan::new(20, 10);
        assert_eq!(shrink.phases[3].sequence, Some(0));

        let grow = MigrationPlan::new(10, 20);
        assert_eq!(grow.phases[3].sequence, Some(0));
        // Ancestor layers start at sequence 1
        assert_eq!(grow.phases[1].sequence, Some(1));
    }

    #[test]
    fn test_plan_serialization() {
        let plan = MigrationPlan::new(20, 10);
        let json = serde_json::to_string(&plan).unwrap();
        let parsed: MigrationPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(plan, parsed);
    }
}
