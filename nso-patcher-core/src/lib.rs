use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub mod conditions;
pub mod diff;
pub mod nso;
pub mod patcher;
pub mod startflags;

use conditions::SettingConditions;
use diff::{default_skip_rules, find_diff_files, should_skip_diff, DiffSkipRule};
use nso::{NsoOffsets, Segment, MAIN_NSO_OFFSETS, SUBSDK_NSO_OFFSETS};
use patcher::{apply_patches, PatchedImage};
use startflags::{
    build_startflags, startflags_diff, ItemFlagTables, StartflagSet, STARTFLAGS_DIFF_FILE_NAME,
};

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("malformed NSO image: {0}")]
    MalformedImage(String),
    #[error("failed to decompress {segment}: {detail}")]
    Decompress { segment: Segment, detail: String },
    #[error("{segment} decompressed to {actual} bytes, header declares {expected}")]
    DecompressedSize {
        segment: Segment,
        expected: usize,
        actual: usize,
    },
    #[error("{file}: {detail}")]
    DiffFormat { file: String, detail: String },
    #[error("{file}: {len} bytes at {address:#X} fall outside {segment} ({segment_len} bytes)")]
    DiffOutOfRange {
        file: String,
        address: u64,
        len: usize,
        segment: Segment,
        segment_len: usize,
    },
    #[error("startflags are {len} bytes, must be less than {limit}")]
    StartflagsOverflow { len: usize, limit: usize },
    #[error("unknown scene '{0}' in startflags")]
    UnknownScene(String),
    #[error("scene flag {flag} for '{scene}' does not fit in a byte")]
    SceneFlagRange { scene: String, flag: u16 },
    #[error("starting count {count} of '{item}' exceeds its {available} flags")]
    FlagTableIndex {
        item: String,
        count: u32,
        available: usize,
    },
    #[error("cannot evaluate condition '{condition}': {detail}")]
    Condition { condition: String, detail: String },
}

pub type Result<T> = std::result::Result<T, PatchError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchSettings {
    /// Extracted exefs (or its parent directory).
    pub input_path: PathBuf,
    /// Directory holding `asm/patches`, `asm/additions`, `startflags.yaml`
    /// and `item_flags.yaml`.
    pub data_path: PathBuf,
    pub output_path: PathBuf,
    /// Item-derived startflags follow this map's order, i.e. sorted by name.
    #[serde(default)]
    pub starting_items: BTreeMap<String, u32>,
    /// Overlaid on `default_world_settings()` when conditions are evaluated.
    #[serde(default)]
    pub world_settings: BTreeMap<String, String>,
    #[serde(default = "default_skip_rules")]
    pub skip_rules: Vec<DiffSkipRule>,
    #[serde(default)]
    pub main_offsets: Option<NsoOffsets>,
    #[serde(default)]
    pub subsdk_offsets: Option<NsoOffsets>,
    #[serde(default)]
    pub debug: bool,
}

impl PatchSettings {
    pub fn new(input_path: PathBuf, data_path: PathBuf, output_path: PathBuf) -> Self {
        Self {
            input_path,
            data_path,
            output_path,
            starting_items: BTreeMap::new(),
            world_settings: BTreeMap::new(),
            skip_rules: default_skip_rules(),
            main_offsets: None,
            subsdk_offsets: None,
            debug: false,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|source| PatchError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// Values assumed for settings the user leaves unset, so the default skip
/// rules always have something to compare against.
pub fn default_world_settings() -> BTreeMap<String, String> {
    let mut settings = BTreeMap::new();
    settings.insert("tunic_swap".to_string(), "off".to_string());
    settings
}

fn join_candidate(base: &Path, candidate: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for part in candidate.split(['/', '\\']) {
        if !part.is_empty() {
            path.push(part);
        }
    }
    path
}

fn find_first_existing(base: &Path, candidates: &[&str]) -> Option<PathBuf> {
    for candidate in candidates {
        let path = join_candidate(base, candidate);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

fn write_bytes_create_dirs(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, data)?;
    Ok(())
}

fn log_image(log: &mut String, name: &str, dest: &Path, image: &PatchedImage) {
    log.push_str(&format!("{}: -> {}\n", name, dest.display()));
    for change in &image.segments {
        log.push_str(&format!(
            "  {}: file_offset=0x{:08X} compressed {} -> {} bytes\n",
            change.segment,
            change.file_offset,
            change.old_compressed_size,
            change.new_compressed_size
        ));
    }
}

/// Patches the main executable with the static diffs, then the additions
/// executable with its diffs plus the generated startflags.
///
/// Nothing is written to `output_path` unless both images patch cleanly.
pub fn run(settings: PatchSettings) -> Result<()> {
    if !settings.input_path.exists() {
        return Err(PatchError::Config(format!(
            "Input path does not exist: {}",
            settings.input_path.display()
        )));
    }

    let main_src = find_first_existing(&settings.input_path, &["exefs/main", "main"])
        .ok_or_else(|| {
            PatchError::Config("Could not find exefs/main under input path".to_string())
        })?;
    let subsdk_src = find_first_existing(&settings.input_path, &["exefs/subsdk1", "subsdk1"])
        .ok_or_else(|| {
            PatchError::Config("Could not find exefs/subsdk1 under input path".to_string())
        })?;

    let main_offsets = settings.main_offsets.unwrap_or(MAIN_NSO_OFFSETS);
    let subsdk_offsets = settings.subsdk_offsets.unwrap_or(SUBSDK_NSO_OFFSETS);

    let mut world_settings = default_world_settings();
    world_settings.extend(settings.world_settings.clone());
    let conditions = SettingConditions::new(&world_settings);
    let skip = |name: &str| should_skip_diff(&settings.skip_rules, &conditions, name);

    info!("Assembling startflags");
    let base_flags = StartflagSet::load(&settings.data_path.join("startflags.yaml"))?;
    let flag_tables = ItemFlagTables::load(&settings.data_path.join("item_flags.yaml"))?;
    let blob = build_startflags(
        &settings.starting_items,
        &flag_tables,
        &base_flags,
        &conditions,
    )?;
    let blob_len = blob.len();
    // Startflags are copied from the start of the additions' rodata.
    let startflags = startflags_diff(subsdk_offsets.rodata, blob);

    info!("Applying asm patches");
    let patch_paths = find_diff_files(&settings.data_path.join("asm").join("patches"))?;
    let main = apply_patches(&main_src, &patch_paths, &main_offsets, skip)?;

    info!("Applying asm additions");
    let subsdk = {
        let temp_dir = tempfile::Builder::new().prefix("nso-patcher").tempdir()?;
        startflags.write(&temp_dir.path().join(STARTFLAGS_DIFF_FILE_NAME))?;

        let mut addition_paths =
            find_diff_files(&settings.data_path.join("asm").join("additions"))?;
        addition_paths.extend(find_diff_files(temp_dir.path())?);

        let patched = apply_patches(&subsdk_src, &addition_paths, &subsdk_offsets, skip)?;
        temp_dir.close()?;
        patched
    };

    let exefs_out = settings.output_path.join("exefs");
    let main_dest = exefs_out.join("main");
    let subsdk_dest = exefs_out.join("subsdk8");
    write_bytes_create_dirs(&main_dest, &main.bytes)?;
    write_bytes_create_dirs(&subsdk_dest, &subsdk.bytes)?;

    if settings.debug {
        startflags.write(&settings.output_path.join(STARTFLAGS_DIFF_FILE_NAME))?;

        let mut log = format!("main: {}\nsubsdk: {}\n", main_src.display(), subsdk_src.display());
        log_image(&mut log, "main", &main_dest, &main);
        log_image(&mut log, "subsdk8", &subsdk_dest, &subsdk);
        log.push_str(&format!("startflags: {} bytes\n", blob_len));
        log.push_str("starting items:\n");
        for (item, count) in &settings.starting_items {
            log.push_str(&format!("  {}: {}\n", item, count));
        }
        fs::write(settings.output_path.join("patch_log.txt"), log)?;
    }

    info!(
        "Patched {} and {}",
        main_dest.display(),
        subsdk_dest.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patcher::extract_segment;
    use crate::patcher::fixtures::build_nso;

    const MAIN: NsoOffsets = NsoOffsets::new(0x1000, 0x2000, 0x3000);
    const SUBSDK: NsoOffsets = NsoOffsets::new(0x8000, 0x9000, 0xA000);

    struct Fixture {
        _root: tempfile::TempDir,
        settings: PatchSettings,
    }

    fn fixture(startflags_yaml: &str) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let input = root.path().join("romfs_dump");
        let data = root.path().join("data");
        let output = root.path().join("out");

        let segment = [0u8; 64];
        let nso = build_nso([&segment, &segment, &segment]);
        fs::create_dir_all(input.join("exefs")).unwrap();
        fs::write(input.join("exefs").join("main"), &nso).unwrap();
        fs::write(input.join("exefs").join("subsdk1"), &nso).unwrap();

        let patches = data.join("asm").join("patches");
        let additions = data.join("asm").join("additions");
        fs::create_dir_all(&patches).unwrap();
        fs::create_dir_all(&additions).unwrap();
        fs::write(patches.join("main-diff.yaml"), "0x1004: [0xAA, 0xBB]\n").unwrap();
        fs::write(patches.join("tunic-swap-diff.yaml"), "0x1010: [0x01]\n").unwrap();
        fs::write(additions.join("hook-diff.yaml"), "0x8000: [0x1F, 0x20]\n").unwrap();
        fs::write(data.join("startflags.yaml"), startflags_yaml).unwrap();
        fs::write(
            data.join("item_flags.yaml"),
            "Itemflags:\n  Progressive Sword: [100, 101, 102]\nStoryflags: {}\n",
        )
        .unwrap();

        let mut settings = PatchSettings::new(input, data, output);
        settings.main_offsets = Some(MAIN);
        settings.subsdk_offsets = Some(SUBSDK);
        settings
            .world_settings
            .insert("tunic_swap".to_string(), "off".to_string());
        settings
            .starting_items
            .insert("Progressive Sword".to_string(), 2);

        Fixture {
            _root: root,
            settings,
        }
    }

    #[test]
    fn patches_both_images() {
        let fx = fixture("Storyflags: [7]\n");
        let output = fx.settings.output_path.clone();
        run(fx.settings).unwrap();

        let main = fs::read(output.join("exefs").join("main")).unwrap();
        let text = extract_segment(&main, Segment::Text).unwrap();
        assert_eq!(&text[4..6], &[0xAA, 0xBB]);
        assert_eq!(text[0x10], 0, "tunic swap diff should be skipped");

        let subsdk = fs::read(output.join("exefs").join("subsdk8")).unwrap();
        let text = extract_segment(&subsdk, Segment::Text).unwrap();
        assert_eq!(&text[..2], &[0x1F, 0x20]);
        let rodata = extract_segment(&subsdk, Segment::Rodata).unwrap();
        assert_eq!(
            &rodata[..14],
            &[7, 0, 0xFF, 0xFF, 0xFF, 0xFF, 100, 0, 101, 0, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn unset_tunic_swap_defaults_to_off() {
        let mut fx = fixture("Storyflags: []\n");
        fx.settings.world_settings.clear();
        let output = fx.settings.output_path.clone();
        run(fx.settings).unwrap();

        let main = fs::read(output.join("exefs").join("main")).unwrap();
        let text = extract_segment(&main, Segment::Text).unwrap();
        assert_eq!(&text[4..6], &[0xAA, 0xBB]);
        assert_eq!(text[0x10], 0);
    }

    #[test]
    fn explicit_tunic_swap_overrides_default() {
        let mut fx = fixture("Storyflags: []\n");
        fx.settings
            .world_settings
            .insert("tunic_swap".to_string(), "on".to_string());
        let output = fx.settings.output_path.clone();
        run(fx.settings).unwrap();

        let main = fs::read(output.join("exefs").join("main")).unwrap();
        let text = extract_segment(&main, Segment::Text).unwrap();
        assert_eq!(text[0x10], 0x01);
    }

    #[test]
    fn oversized_startflags_write_nothing() {
        let flags: Vec<String> = (0..500).map(|f| f.to_string()).collect();
        let fx = fixture(&format!("Storyflags: [{}]\n", flags.join(", ")));
        let output = fx.settings.output_path.clone();

        let err = run(fx.settings).unwrap_err();
        assert!(matches!(err, PatchError::StartflagsOverflow { .. }));
        assert!(!output.exists());
    }

    #[test]
    fn failed_diff_writes_nothing() {
        let fx = fixture("Storyflags: []\n");
        let additions = fx.settings.data_path.join("asm").join("additions");
        fs::write(additions.join("bad-diff.yaml"), "0x803F: [1, 2]\n").unwrap();
        let output = fx.settings.output_path.clone();

        let err = run(fx.settings).unwrap_err();
        assert!(matches!(err, PatchError::DiffOutOfRange { .. }));
        assert!(!output.exists());
    }

    #[test]
    fn debug_writes_startflags_and_log() {
        let mut fx = fixture("Storyflags: []\n");
        fx.settings.debug = true;
        let output = fx.settings.output_path.clone();
        run(fx.settings).unwrap();

        assert!(output.join(STARTFLAGS_DIFF_FILE_NAME).exists());
        let log = fs::read_to_string(output.join("patch_log.txt")).unwrap();
        assert!(log.contains("Progressive Sword: 2"));
    }

    #[test]
    fn missing_input_is_a_config_error() {
        let settings = PatchSettings::new(
            PathBuf::from("/nonexistent/input"),
            PathBuf::from("data"),
            PathBuf::from("out"),
        );
        assert!(matches!(run(settings), Err(PatchError::Config(_))));
    }

    #[test]
    fn settings_json_defaults_skip_rules() {
        let json = r#"{"input_path": "in", "data_path": "data", "output_path": "out"}"#;
        let settings: PatchSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.skip_rules, default_skip_rules());
        assert!(settings.main_offsets.is_none());
    }
}
