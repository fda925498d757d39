//! Source and receiver point lists for external round-tripping.
//!
//! Lists are expanded from the geometry, deduplicated by identity and
//! sorted. Edited records read back in become [`PointEdits`], which
//! override coordinates and active flags during binning.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::bounds::Coord;
use crate::config::BinningConfig;
use crate::error::ConfigError;
use crate::geometry::{Role, SurveyGeometry, hex_digest};
use crate::lattice::{GrowPoints, RollOffsets};
use crate::trace::PointId;
use crate::transform::CoordinateTransform;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    pub role: Role,
    pub id: PointId,
    pub x: f64,
    pub y: f64,
    /// Projected coordinates; ignored on re-import
    #[serde(default)]
    pub easting: f64,
    #[serde(default)]
    pub northing: f64,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PointList {
    pub sources: Vec<PointRecord>,
    pub receivers: Vec<PointRecord>,
}

impl PointList {
    /// Expand every block into unique, in-border points per role.
    /// The first occurrence of an identity wins.
    pub fn from_geometry(
        geometry: &SurveyGeometry,
        config: &BinningConfig,
        transform: &dyn CoordinateTransform,
    ) -> Self {
        let mut sources = BTreeMap::new();
        let mut receivers = BTreeMap::new();

        for (block_index, block) in geometry.blocks.iter().enumerate() {
            for template in &block.templates {
                for instance in RollOffsets::new(&template.roll) {
                    for seed in &template.seeds {
                        let target = match seed.role {
                            Role::Source => &mut sources,
                            Role::Receiver => &mut receivers,
                        };
                        for point in GrowPoints::new(seed, (instance.dx, instance.dy)) {
                            let Coord { x, y } = point.position;
                            if !block.admits(seed.role, x, y) {
                                continue;
                            }
                            let id = config
                                .numbering
                                .identify(block_index, x, y, &config.bin_size);
                            target.entry(id).or_insert_with(|| {
                                let (easting, northing) = transform.to_projected(x, y);
                                PointRecord {
                                    role: seed.role,
                                    id,
                                    x,
                                    y,
                                    easting,
                                    northing,
                                    active: true,
                                }
                            });
                        }
                    }
                }
            }
        }

        let list = Self {
            sources: sources.into_values().collect(),
            receivers: receivers.into_values().collect(),
        };
        info!(
            sources = list.sources.len(),
            receivers = list.receivers.len(),
            "expanded point lists"
        );
        list
    }

    pub fn len(&self) -> usize {
        self.sources.len() + self.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> impl Iterator<Item = &PointRecord> {
        self.sources.iter().chain(self.receivers.iter())
    }

    pub fn write_json(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn read_json(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Externally edited position and activity of one point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointEdit {
    pub x: f64,
    pub y: f64,
    pub active: bool,
}

/// Overrides keyed by (role, identity).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PointEdits {
    edits: HashMap<(Role, PointId), PointEdit>,
}

impl PointEdits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a PointRecord>) -> Self {
        let mut edits = Self::new();
        edits.merge(records);
        edits
    }

    pub fn from_list(list: &PointList) -> Self {
        Self::from_records(list.records())
    }

    /// Later records replace earlier ones with the same identity
    pub fn merge<'a>(&mut self, records: impl IntoIterator<Item = &'a PointRecord>) {
        let before = self.edits.len();
        for record in records {
            self.edits.insert(
                (record.role, record.id),
                PointEdit {
                    x: record.x,
                    y: record.y,
                    active: record.active,
                },
            );
        }
        debug!(
            added = self.edits.len() - before,
            total = self.edits.len(),
            "merged point edits"
        );
    }

    pub fn get(&self, role: Role, id: PointId) -> Option<&PointEdit> {
        self.edits.get(&(role, id))
    }

    /// Final position of a generated point, or `None` if it was deactivated
    pub fn resolve(&self, role: Role, id: PointId, position: Coord) -> Option<Coord> {
        match self.get(role, id) {
            Some(edit) if !edit.active => None,
            Some(edit) => Some(Coord::new(edit.x, edit.y)),
            None => Some(position),
        }
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Order-independent digest of every override
    pub fn fingerprint(&self) -> String {
        let mut entries: Vec<_> = self.edits.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut hasher = Sha256::new();
        for ((role, id), edit) in entries {
            hasher.update([*role as u8]);
            hasher.update(id.index.to_le_bytes());
            hasher.update(id.line.to_le_bytes());
            hasher.update(id.point.to_le_bytes());
            hasher.update(edit.x.to_le_bytes());
            hasher.update(edit.y.to_le_bytes());
            hasher.update([edit.active as u8]);
        }
        hex_digest(hasher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::Rect;
    use crate::geometry::{Block, Seed, Template};
    use crate::transform::{AffineTransform, GridTransform};

    fn geometry() -> SurveyGeometry {
        SurveyGeometry::new("g").with_block(
            Block::new("B")
                .with_borders(None, Some(Rect::new(0.0, 0.0, 100.0, 100.0)))
                .with_template(
                    Template::new("T")
                        .with_roll(2, 50.0, 0.0)
                        .with_seed(Seed::new("s", Role::Source, 0.0, 0.0).with_grow(2, 0.0, 25.0))
                        .with_seed(Seed::new("r", Role::Receiver, 0.0, 0.0).with_grow(4, 25.0, 0.0)),
                ),
        )
    }

    fn config() -> BinningConfig {
        BinningConfig::new(Rect::new(0.0, 0.0, 200.0, 200.0), 25.0, 25.0)
    }

    #[test]
    fn test_point_list_dedups_and_clips() {
        let list = PointList::from_geometry(&geometry(), &config(), &GridTransform::default());
        // Two rolls of 4 receivers overlap at x = 50 and 75; x = 125 is outside the border.
        let xs: Vec<f64> = list.receivers.iter().map(|r| r.x).collect();
        assert_eq!(xs, vec![0.0, 25.0, 50.0, 75.0, 100.0]);
        assert_eq!(list.sources.len(), 4);
        assert!(list.records().all(|r| r.active));
    }

    #[test]
    fn test_projected_coordinates() {
        let transform = GridTransform::new(AffineTransform::translation(1000.0, 0.0), None);
        let list = PointList::from_geometry(&geometry(), &config(), &transform);
        assert!(list.records().all(|r| r.easting == r.x + 1000.0 && r.northing == r.y));
    }

    #[test]
    fn test_round_trip_and_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.json");
        let mut list = PointList::from_geometry(&geometry(), &config(), &GridTransform::default());
        list.receivers[0].active = false;
        list.receivers[1].x += 3.0;
        list.write_json(&path).unwrap();

        let edits = PointEdits::from_list(&PointList::read_json(&path).unwrap());
        let dead = &list.receivers[0];
        let moved = &list.receivers[1];
        assert_eq!(edits.resolve(Role::Receiver, dead.id, Coord::new(0.0, 0.0)), None);
        assert_eq!(
            edits.resolve(Role::Receiver, moved.id, Coord::new(25.0, 0.0)),
            Some(Coord::new(28.0, 0.0))
        );
        let unknown = PointId::new(9, 1, 1);
        assert_eq!(
            edits.resolve(Role::Source, unknown, Coord::new(1.0, 2.0)),
            Some(Coord::new(1.0, 2.0))
        );
    }

    #[test]
    fn test_fingerprint_changes_with_edits() {
        let list = PointList::from_geometry(&geometry(), &config(), &GridTransform::default());
        let a = PointEdits::from_list(&list);
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut changed = list.receivers[2].clone();
        changed.active = false;
        b.merge([&changed]);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.len(), b.len());
    }
}
