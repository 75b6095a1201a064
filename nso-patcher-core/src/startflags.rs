//! Builds the startflags blob: the story, scene, item and dungeon flags the
//! game sets when a new file is created, encoded as one diff against the
//! additions image.

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::conditions::ConditionEvaluator;
use crate::diff::{Diff, DiffFile};
use crate::{PatchError, Result};

/// Size of the fixed buffer the startflags are copied into at runtime. The
/// blob has to be strictly smaller.
pub const STARTFLAGS_MAX_LEN: usize = 1000;
pub const SECTION_TERMINATOR: [u8; 2] = [0xFF, 0xFF];
pub const STARTFLAGS_DIFF_FILE_NAME: &str = "startflags-diff.yaml";

/// Default scene-name to flag-area index table. `SceneIndices` in the
/// startflags file extends or overrides it.
pub const SCENE_INDICES: &[(&str, u8)] = &[
    ("Skyloft", 0),
    ("Faron Woods", 1),
    ("Lake Floria", 2),
    ("Flooded Faron Woods", 3),
    ("Eldin Volcano", 4),
    ("Volcano Summit", 5),
    ("Lanayru Desert", 6),
    ("Lanayru Sand Sea", 7),
    ("Lanayru Gorge", 8),
    ("Sealed Grounds", 9),
    ("Skyview", 10),
    ("Ancient Cistern", 11),
    ("Earth Temple", 12),
    ("Fire Sanctuary", 13),
    ("Lanayru Mining Facility", 14),
    ("Sandship", 15),
    ("Sky Keep", 16),
    ("Sky", 17),
    ("Thunderhead", 18),
    ("Faron Silent Realm", 19),
    ("Eldin Silent Realm", 20),
    ("Lanayru Silent Realm", 21),
    ("Skyloft Silent Realm", 22),
];

/// One element of a flag list: a bare flag, or a group that only applies
/// while its condition holds.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FlagEntry {
    Plain(u16),
    Conditional { condition: String, flags: Vec<u16> },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFlagEntry {
    Plain(u16),
    Conditional(BTreeMap<String, Vec<u16>>),
}

impl TryFrom<RawFlagEntry> for FlagEntry {
    type Error = String;

    fn try_from(raw: RawFlagEntry) -> std::result::Result<Self, String> {
        match raw {
            RawFlagEntry::Plain(flag) => Ok(FlagEntry::Plain(flag)),
            RawFlagEntry::Conditional(group) => {
                if group.len() != 1 {
                    return Err(format!(
                        "conditional flag group must have exactly one condition, found {}",
                        group.len()
                    ));
                }
                let (condition, flags) = group.into_iter().next().unwrap_or_default();
                Ok(FlagEntry::Conditional { condition, flags })
            }
        }
    }
}

impl<'de> Deserialize<'de> for FlagEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = RawFlagEntry::deserialize(deserializer)?;
        FlagEntry::try_from(raw).map_err(de::Error::custom)
    }
}

/// Flags that a starting item contributes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FlagSpec {
    /// One flag, set whenever the item is owned.
    Single(u16),
    /// Every flag is set whenever the item is owned.
    Fixed(Vec<u16>),
    /// Progressive item: owning `n` copies sets the first `n` flags.
    Indexed(Vec<u16>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFlagSpec {
    Single(u16),
    Indexed(Vec<u16>),
    Fixed { fixed: Vec<u16> },
}

impl<'de> Deserialize<'de> for FlagSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(match RawFlagSpec::deserialize(deserializer)? {
            RawFlagSpec::Single(flag) => FlagSpec::Single(flag),
            RawFlagSpec::Indexed(flags) => FlagSpec::Indexed(flags),
            RawFlagSpec::Fixed { fixed } => FlagSpec::Fixed(fixed),
        })
    }
}

impl FlagSpec {
    pub fn resolve(&self, item: &str, count: u32) -> Result<Vec<u16>> {
        match self {
            FlagSpec::Single(flag) => Ok(vec![*flag]),
            FlagSpec::Fixed(flags) => Ok(flags.clone()),
            FlagSpec::Indexed(flags) => {
                let wanted = count as usize;
                flags
                    .get(..wanted)
                    .map(<[u16]>::to_vec)
                    .ok_or_else(|| PatchError::FlagTableIndex {
                        item: item.to_string(),
                        count,
                        available: flags.len(),
                    })
            }
        }
    }
}

/// Per-item story and item flag tables.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ItemFlagTables {
    #[serde(rename = "Itemflags", default)]
    pub item_flags: BTreeMap<String, FlagSpec>,
    #[serde(rename = "Storyflags", default)]
    pub story_flags: BTreeMap<String, FlagSpec>,
}

impl ItemFlagTables {
    pub fn load(path: &Path) -> Result<Self> {
        load_yaml(path)
    }
}

/// Flag lists grouped by scene, in file order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SceneFlags(pub Vec<(String, Vec<FlagEntry>)>);

impl<'de> Deserialize<'de> for SceneFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct SceneFlagsVisitor;

        impl<'de> Visitor<'de> for SceneFlagsVisitor {
            type Value = SceneFlags;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of scene name to flag list")
            }

            fn visit_unit<E: de::Error>(self) -> std::result::Result<SceneFlags, E> {
                Ok(SceneFlags::default())
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<SceneFlags, A::Error> {
                let mut scenes = Vec::new();
                while let Some((scene, flags)) = map.next_entry::<String, Option<Vec<FlagEntry>>>()? {
                    scenes.push((scene, flags.unwrap_or_default()));
                }
                Ok(SceneFlags(scenes))
            }
        }

        deserializer.deserialize_any(SceneFlagsVisitor)
    }
}

/// Base startflags shared by every seed, before starting items are added.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StartflagSet {
    #[serde(rename = "Storyflags", default)]
    pub story: Vec<FlagEntry>,
    #[serde(rename = "Sceneflags", default)]
    pub scene: SceneFlags,
    #[serde(rename = "Itemflags", default)]
    pub item: Vec<FlagEntry>,
    #[serde(rename = "Dungeonflags", default)]
    pub dungeon: SceneFlags,
    #[serde(rename = "SceneIndices", default)]
    pub scene_indices: BTreeMap<String, u8>,
}

impl StartflagSet {
    pub fn load(path: &Path) -> Result<Self> {
        load_yaml(path)
    }

    pub fn scene_index(&self, scene: &str) -> Result<u8> {
        if let Some(&index) = self.scene_indices.get(scene) {
            return Ok(index);
        }
        SCENE_INDICES
            .iter()
            .find(|(name, _)| *name == scene)
            .map(|&(_, index)| index)
            .ok_or_else(|| PatchError::UnknownScene(scene.to_string()))
    }
}

fn load_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let src = fs::read_to_string(path).map_err(|source| PatchError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_yaml_ng::from_str(&src)?)
}

/// Flattens a flag list, keeping conditional groups whose condition holds.
pub fn resolve_flags(
    entries: &[FlagEntry],
    conditions: &dyn ConditionEvaluator,
) -> Result<Vec<u16>> {
    let mut flags = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            FlagEntry::Plain(flag) => flags.push(*flag),
            FlagEntry::Conditional {
                condition,
                flags: group,
            } => {
                if conditions.evaluate_onlyif(condition)? {
                    flags.extend_from_slice(group);
                }
            }
        }
    }
    Ok(flags)
}

/// Item-derived flags are appended in the iteration order of
/// `starting_items`, which is sorted by item name.
pub fn build_startflags(
    starting_items: &BTreeMap<String, u32>,
    tables: &ItemFlagTables,
    base: &StartflagSet,
    conditions: &dyn ConditionEvaluator,
) -> Result<Vec<u8>> {
    let mut story = base.story.clone();
    let mut items = base.item.clone();

    for (item, &count) in starting_items {
        if let Some(spec) = tables.item_flags.get(item) {
            items.extend(spec.resolve(item, count)?.into_iter().map(FlagEntry::Plain));
        }
        if let Some(spec) = tables.story_flags.get(item) {
            story.extend(spec.resolve(item, count)?.into_iter().map(FlagEntry::Plain));
        }
    }

    let mut out = Vec::new();
    write_flags(&mut out, &resolve_flags(&story, conditions)?);
    write_scene_flags(&mut out, base, &base.scene, conditions)?;
    write_flags(&mut out, &resolve_flags(&items, conditions)?);
    write_scene_flags(&mut out, base, &base.dungeon, conditions)?;

    if out.len() >= STARTFLAGS_MAX_LEN {
        return Err(PatchError::StartflagsOverflow {
            len: out.len(),
            limit: STARTFLAGS_MAX_LEN,
        });
    }
    Ok(out)
}

fn write_flags(out: &mut Vec<u8>, flags: &[u16]) {
    for flag in flags {
        out.extend_from_slice(&flag.to_le_bytes());
    }
    out.extend_from_slice(&SECTION_TERMINATOR);
}

fn write_scene_flags(
    out: &mut Vec<u8>,
    base: &StartflagSet,
    scenes: &SceneFlags,
    conditions: &dyn ConditionEvaluator,
) -> Result<()> {
    for (scene, entries) in &scenes.0 {
        let index = base.scene_index(scene)?;
        for flag in resolve_flags(entries, conditions)? {
            let flag = u8::try_from(flag).map_err(|_| PatchError::SceneFlagRange {
                scene: scene.clone(),
                flag,
            })?;
            out.push(index);
            out.push(flag);
        }
    }
    out.extend_from_slice(&SECTION_TERMINATOR);
    Ok(())
}

/// Wraps the blob as a single diff at `target`.
pub fn startflags_diff(target: u64, blob: Vec<u8>) -> DiffFile {
    DiffFile::new(
        STARTFLAGS_DIFF_FILE_NAME,
        vec![Diff {
            address: target,
            bytes: blob,
        }],
    )
}
