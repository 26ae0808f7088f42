//! Application configuration.
//!
//! The core only consumes a resolved [`AppConfig`] value. Loading is lenient:
//! a malformed field is replaced by its documented default and reported as a
//! [`ConfigIssue`], never as a fatal error.

use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Global application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Video encoding settings.
    #[serde(default)]
    pub video: VideoConfig,

    /// Audio handling settings.
    #[serde(default)]
    pub audio: AudioConfig,

    /// Publish-copy and upload settings.
    #[serde(default)]
    pub publish: PublishConfig,

    /// Paired-recording merge settings.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Remote camera sources.
    #[serde(default)]
    pub cameras: CameraConfig,

    /// External tool locations.
    #[serde(default)]
    pub tools: ToolPaths,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Named bundle of encoding defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// High-quality archive for later analysis.
    Analysis,
    /// Balanced settings for video platforms.
    Upload,
    /// No profile defaults applied.
    Custom,
}

impl Profile {
    pub const ALL: [Profile; 3] = [Profile::Analysis, Profile::Upload, Profile::Custom];

    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Analysis => "analysis",
            Profile::Upload => "upload",
            Profile::Custom => "custom",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoder selection as configured by the user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EncoderSetting {
    /// Hardware encoder when the capability probe passes, software otherwise.
    Auto,
    /// A specific encoder, used unconditionally.
    Named(String),
}

impl From<String> for EncoderSetting {
    fn from(value: String) -> Self {
        if value.trim().eq_ignore_ascii_case("auto") || value.trim().is_empty() {
            EncoderSetting::Auto
        } else {
            EncoderSetting::Named(value.trim().to_string())
        }
    }
}

impl From<EncoderSetting> for String {
    fn from(value: EncoderSetting) -> Self {
        match value {
            EncoderSetting::Auto => "auto".to_string(),
            EncoderSetting::Named(name) => name,
        }
    }
}

impl fmt::Display for EncoderSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderSetting::Auto => f.write_str("auto"),
            EncoderSetting::Named(name) => f.write_str(name),
        }
    }
}

/// Output container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// H.264 in MP4.
    Mp4,
    /// Motion-JPEG in AVI.
    Avi,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Avi => "avi",
        }
    }
}

/// Video encoding settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Nominal recording frame rate.
    pub fps: u32,
    pub output_format: OutputFormat,
    /// Quality value (CRF for x264, CQ for NVENC).
    pub crf: u8,
    pub lossless: bool,
    /// x264-style preset name; mapped for hardware encoders.
    pub preset: String,
    pub encoder: EncoderSetting,
    pub profile: Profile,
    /// Re-encode even when the output already exists.
    pub overwrite: bool,
    /// Correct frame-drop drift against the paired audio track.
    pub audio_sync: bool,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            fps: 25,
            output_format: OutputFormat::Mp4,
            crf: 18,
            lossless: false,
            preset: "medium".to_string(),
            encoder: EncoderSetting::Auto,
            profile: Profile::Custom,
            overwrite: false,
            audio_sync: false,
        }
    }
}

/// Fields a profile may set. `None` leaves the current value alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfileFields {
    pub encoder: Option<EncoderSetting>,
    pub lossless: Option<bool>,
    pub preset: Option<String>,
    pub crf: Option<u8>,
    pub output_format: Option<OutputFormat>,
}

/// Defaults a profile contributes. `Custom` contributes nothing.
pub fn profile_defaults(profile: Profile) -> ProfileFields {
    match profile {
        Profile::Analysis => ProfileFields {
            encoder: Some(EncoderSetting::Auto),
            lossless: Some(false),
            preset: Some("slow".to_string()),
            crf: Some(12),
            output_format: Some(OutputFormat::Mp4),
        },
        Profile::Upload => ProfileFields {
            encoder: Some(EncoderSetting::Auto),
            lossless: Some(false),
            preset: Some("medium".to_string()),
            crf: Some(23),
            output_format: Some(OutputFormat::Mp4),
        },
        Profile::Custom => ProfileFields::default(),
    }
}

impl VideoConfig {
    /// Apply a profile's defaults. User overrides are applied afterwards by
    /// the caller, so they always win.
    pub fn apply_profile(&mut self, profile: Profile) {
        let fields = profile_defaults(profile);
        if let Some(encoder) = fields.encoder {
            self.encoder = encoder;
        }
        if let Some(lossless) = fields.lossless {
            self.lossless = lossless;
        }
        if let Some(preset) = fields.preset {
            self.preset = preset;
        }
        if let Some(crf) = fields.crf {
            self.crf = crf;
        }
        if let Some(format) = fields.output_format {
            self.output_format = format;
        }
        self.profile = profile;
    }
}

/// Audio handling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Mux the paired audio file into the output.
    pub include_audio: bool,
    /// Apply the compressor + loudness normalization chain.
    pub amplify_audio: bool,
    /// Extra stem suffix used to locate the audio file (`<stem><suffix>.wav`).
    pub audio_suffix: String,
    pub audio_bitrate: String,
    /// `compand` transfer points.
    pub compand_points: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            include_audio: true,
            amplify_audio: true,
            audio_suffix: String::new(),
            audio_bitrate: "192k".to_string(),
            compand_points: "-70/-60|-30/-10".to_string(),
        }
    }
}

/// Publish-optimized copy and upload settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Produce a `<stem>_youtube.mp4` copy after a successful MP4 encode.
    pub create_copy: bool,
    /// Upload finished files through the publish collaborator.
    pub upload: bool,
    pub crf: u8,
    pub maxrate: String,
    pub bufsize: String,
    pub audio_bitrate: String,
    /// External uploader invoked as `<cmd...> <file> <title> <playlist>`.
    #[serde(default)]
    pub uploader_command: Vec<String>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            create_copy: false,
            upload: false,
            crf: 23,
            maxrate: "8M".to_string(),
            bufsize: "16M".to_string(),
            audio_bitrate: "128k".to_string(),
            uploader_command: Vec::new(),
        }
    }
}

/// Paired-recording merge settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    pub enabled: bool,
    /// Title card length in seconds.
    pub title_duration_secs: u32,
    /// Title card background color (`#RRGGBB`).
    pub background: String,
    /// Title card text color (`#RRGGBB`).
    pub text_color: String,
    /// Label template; `{n}` is replaced by the 1-based part index.
    pub title_template: String,
    /// Explicit labels by part index, taking precedence over the template.
    #[serde(default)]
    pub title_overrides: Vec<String>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            title_duration_secs: 3,
            background: "#000000".to_string(),
            text_color: "#FFFFFF".to_string(),
            title_template: "{n}. Half".to_string(),
            title_overrides: Vec::new(),
        }
    }
}

impl MergeConfig {
    /// Label for the 1-based part `index`.
    pub fn title_for(&self, index: usize) -> String {
        match index
            .checked_sub(1)
            .and_then(|i| self.title_overrides.get(i))
            .filter(|s| !s.trim().is_empty())
        {
            Some(label) => label.clone(),
            None => self.title_template.replace("{n}", &index.to_string()),
        }
    }
}

/// Remote camera sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Local destination root; each camera gets a subdirectory.
    pub destination: PathBuf,
    /// Recording directory on the camera.
    pub source_dir: String,
    /// Remove recordings on the camera after a verified copy.
    pub delete_after_download: bool,
    #[serde(default)]
    pub devices: Vec<CameraDevice>,
}

/// One remote camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraDevice {
    pub name: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    /// Local mount of the camera's recording directory, when the transport
    /// is a mounted remote filesystem.
    #[serde(default)]
    pub mount_path: Option<PathBuf>,
}

fn default_port() -> u16 {
    22
}

/// External tool locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPaths {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub nvidia_smi: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            nvidia_smi: PathBuf::from("nvidia-smi"),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "camreel=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

/// A configuration field that was malformed and replaced by its default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// Dotted field path, e.g. `video.crf`.
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (default used)", self.field, self.message)
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        Self::load_from(&config_file_path())
    }

    /// Load config from `path`. Missing or unreadable files yield defaults;
    /// malformed fields are replaced individually.
    pub fn load_from(path: &Path) -> Self {
        let (config, issues) = Self::read_lenient(path);
        for issue in &issues {
            tracing::warn!(path = %path.display(), "Config field invalid: {issue}");
        }
        config
    }

    /// Like [`AppConfig::load_from`], but hands the field issues back
    /// instead of logging them, for callers that load before logging is up.
    pub fn read_lenient(path: &Path) -> (Self, Vec<ConfigIssue>) {
        if !path.exists() {
            return (Self::default(), Vec::new());
        }
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_json_lenient(&content),
            Err(e) => (
                Self::default(),
                vec![issue("<file>", format!("cannot read {}: {e}", path.display()))],
            ),
        }
    }

    /// Parse config text, substituting the default for every malformed field.
    pub fn from_json_lenient(text: &str) -> (Self, Vec<ConfigIssue>) {
        let mut issues = Vec::new();
        let root = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                issues.push(ConfigIssue {
                    field: "<root>".to_string(),
                    message: "expected a JSON object".to_string(),
                });
                return (Self::default(), issues);
            }
            Err(e) => {
                issues.push(ConfigIssue {
                    field: "<root>".to_string(),
                    message: e.to_string(),
                });
                return (Self::default(), issues);
            }
        };

        let mut config = Self {
            video: merge_section("video", root.get("video"), &mut issues),
            audio: merge_section("audio", root.get("audio"), &mut issues),
            publish: merge_section("publish", root.get("publish"), &mut issues),
            merge: merge_section("merge", root.get("merge"), &mut issues),
            cameras: merge_section("cameras", root.get("cameras"), &mut issues),
            tools: merge_section("tools", root.get("tools"), &mut issues),
            logging: merge_section("logging", root.get("logging"), &mut issues),
        };
        config.validate(&mut issues);
        (config, issues)
    }

    /// Range and format checks that serde alone cannot express.
    fn validate(&mut self, issues: &mut Vec<ConfigIssue>) {
        let video_defaults = VideoConfig::default();
        if !(1..=240).contains(&self.video.fps) {
            issues.push(issue("video.fps", format!("{} is outside 1..=240", self.video.fps)));
            self.video.fps = video_defaults.fps;
        }
        if self.video.crf > 51 {
            issues.push(issue("video.crf", format!("{} is above 51", self.video.crf)));
            self.video.crf = video_defaults.crf;
        }
        if !KNOWN_PRESETS.contains(&self.video.preset.as_str()) {
            issues.push(issue(
                "video.preset",
                format!("unknown preset `{}`", self.video.preset),
            ));
            self.video.preset = video_defaults.preset;
        }
        if self.publish.crf > 51 {
            issues.push(issue("publish.crf", format!("{} is above 51", self.publish.crf)));
            self.publish.crf = PublishConfig::default().crf;
        }

        let merge_defaults = MergeConfig::default();
        if !(1..=60).contains(&self.merge.title_duration_secs) {
            issues.push(issue(
                "merge.title_duration_secs",
                format!("{} is outside 1..=60", self.merge.title_duration_secs),
            ));
            self.merge.title_duration_secs = merge_defaults.title_duration_secs;
        }
        if !is_hex_color(&self.merge.background) {
            issues.push(issue(
                "merge.background",
                format!("`{}` is not #RRGGBB", self.merge.background),
            ));
            self.merge.background = merge_defaults.background;
        }
        if !is_hex_color(&self.merge.text_color) {
            issues.push(issue(
                "merge.text_color",
                format!("`{}` is not #RRGGBB", self.merge.text_color),
            ));
            self.merge.text_color = merge_defaults.text_color;
        }
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<(), std::io::Error> {
        self.save_to(&config_file_path())
    }

    /// Save config to `path`.
    pub fn save_to(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}

/// Immutable configuration snapshot consumed by the pipeline.
///
/// Cloning is cheap; every stage of a run sees the same values even if the
/// foreground edits its own [`AppConfig`] meanwhile.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig(Arc<AppConfig>);

impl ResolvedConfig {
    pub fn new(config: AppConfig) -> Self {
        Self(Arc::new(config))
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}

impl Deref for ResolvedConfig {
    type Target = AppConfig;

    fn deref(&self) -> &AppConfig {
        &self.0
    }
}

impl From<AppConfig> for ResolvedConfig {
    fn from(config: AppConfig) -> Self {
        Self::new(config)
    }
}

/// x264 preset names accepted in `video.preset`.
pub const KNOWN_PRESETS: [&str; 9] = [
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];

fn issue(field: &str, message: String) -> ConfigIssue {
    ConfigIssue {
        field: field.to_string(),
        message,
    }
}

fn is_hex_color(value: &str) -> bool {
    value.len() == 7
        && value.starts_with('#')
        && value[1..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Overlay `input` onto the section defaults one field at a time, keeping
/// the default for each field that does not deserialize.
fn merge_section<T>(name: &str, input: Option<&Value>, issues: &mut Vec<ConfigIssue>) -> T
where
    T: Serialize + DeserializeOwned + Default,
{
    let Some(input) = input else {
        return T::default();
    };
    let Some(input_map) = input.as_object() else {
        issues.push(issue(name, "expected an object".to_string()));
        return T::default();
    };
    let mut merged = match serde_json::to_value(T::default()) {
        Ok(Value::Object(map)) => map,
        _ => return T::default(),
    };

    for (key, value) in input_map {
        if !merged.contains_key(key) {
            tracing::debug!(section = name, field = %key, "Ignoring unknown config field");
            continue;
        }
        let previous = merged.insert(key.clone(), value.clone());
        if let Err(e) = serde_json::from_value::<T>(Value::Object(merged.clone())) {
            issues.push(issue(&format!("{name}.{key}"), e.to_string()));
            if let Some(previous) = previous {
                merged.insert(key.clone(), previous);
            }
        }
    }

    serde_json::from_value(Value::Object(merged)).unwrap_or_default()
}

/// Standard config file location.
pub fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("camreel").join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.video.fps, 25);
        assert_eq!(config.video.crf, 18);
        assert_eq!(config.video.encoder, EncoderSetting::Auto);
        assert!(!config.video.overwrite);
        assert_eq!(config.audio.audio_bitrate, "192k");
        assert_eq!(config.merge.title_duration_secs, 3);
    }

    #[test]
    fn test_profile_applies_before_overrides() {
        let mut video = VideoConfig::default();
        video.apply_profile(Profile::Analysis);
        assert_eq!(video.crf, 12);
        assert_eq!(video.preset, "slow");
        video.crf = 20;
        assert_eq!(video.crf, 20);
        assert_eq!(video.profile, Profile::Analysis);
    }

    #[test]
    fn test_custom_profile_changes_nothing() {
        let mut video = VideoConfig {
            crf: 30,
            preset: "fast".to_string(),
            ..VideoConfig::default()
        };
        video.apply_profile(Profile::Custom);
        assert_eq!(video.crf, 30);
        assert_eq!(video.preset, "fast");
        assert_eq!(profile_defaults(Profile::Custom), ProfileFields::default());
    }

    #[test]
    fn test_lenient_parse_replaces_only_bad_fields() {
        let text = r##"{
            "video": { "fps": "fast", "crf": 22, "encoder": "libx264" },
            "merge": { "background": "red", "title_duration_secs": 5 }
        }"##;
        let (config, issues) = AppConfig::from_json_lenient(text);
        assert_eq!(config.video.fps, 25);
        assert_eq!(config.video.crf, 22);
        assert_eq!(
            config.video.encoder,
            EncoderSetting::Named("libx264".to_string())
        );
        assert_eq!(config.merge.background, "#000000");
        assert_eq!(config.merge.title_duration_secs, 5);
        let fields: Vec<_> = issues.iter().map(|i| i.field.as_str()).collect();
        assert!(fields.contains(&"video.fps"));
        assert!(fields.contains(&"merge.background"));
        assert_eq!(issues.len(), 2);
    }

    #[test]
    fn test_lenient_parse_of_garbage_yields_defaults() {
        let (config, issues) = AppConfig::from_json_lenient("not json");
        assert_eq!(config, AppConfig::default());
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn test_range_validation() {
        let (config, issues) =
            AppConfig::from_json_lenient(r#"{"video": {"crf": 80, "preset": "warp"}}"#);
        assert_eq!(config.video.crf, 18);
        assert_eq!(config.video.preset, "medium");
        assert_eq!(issues.len(), 2);
    }

    #[test]
    fn test_title_template_and_overrides() {
        let mut merge = MergeConfig::default();
        assert_eq!(merge.title_for(2), "2. Half");
        merge.title_overrides = vec!["Kick-off".to_string(), String::new()];
        assert_eq!(merge.title_for(1), "Kick-off");
        assert_eq!(merge.title_for(2), "2. Half");
        assert_eq!(merge.title_for(3), "3. Half");
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = std::env::temp_dir().join(format!("camreel_config_{}", std::process::id()));
        let path = dir.join("config.json");
        let mut config = AppConfig::default();
        config.video.apply_profile(Profile::Upload);
        config.save_to(&path).unwrap();
        assert_eq!(AppConfig::load_from(&path), config);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_read_lenient_reports_bad_fields() {
        let dir = std::env::temp_dir().join(format!("camreel_config_lenient_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, r#"{"video": {"crf": "high", "fps": 30}}"#).unwrap();

        let (config, issues) = AppConfig::read_lenient(&path);
        assert_eq!(config.video.fps, 30);
        assert_eq!(config.video.crf, VideoConfig::default().crf);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "video.crf");

        let (config, issues) = AppConfig::read_lenient(&dir.join("missing.json"));
        assert_eq!(config, AppConfig::default());
        assert!(issues.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }
}
