//! Localization configuration file.
//!
//! One document holds the frame names, the filter parameters and an optional initial pose. It
//! can be stored as JSON, YAML or TOML; [`LocalizationConfig::to_file`] and
//! [`LocalizationConfig::from_file`] pick the format from the file extension.
//!
//! ```toml
//! [frames]
//! map_frame = "map"
//! odom_frame = "odom"
//! base_link_frame = "base_link"
//!
//! [filter]
//! num_particles = 500
//! resampling = "systematic"
//!
//! [filter.laser_model]
//! num_beams = 100
//! sigma_hit = 0.2
//!
//! [initial_pose]
//! x = 1.0
//! y = 2.0
//! rz = 0.0
//! ```
use crate::filter::FilterConfig;
use crate::geometry::Pose2D;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// Names of the coordinate frames the localizer relates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub map_frame: String,
    pub odom_frame: String,
    pub base_link_frame: String,
}

impl Default for FrameConfig {
    fn default() -> Self {
        FrameConfig {
            map_frame: "map".to_string(),
            odom_frame: "odom".to_string(),
            base_link_frame: "base_link".to_string(),
        }
    }
}

/// Start-up pose estimate, heading given as a rotation about z.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InitialPose {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub rz: f64,
}

impl From<InitialPose> for Pose2D {
    fn from(p: InitialPose) -> Self {
        Pose2D::new(p.x, p.y, p.rz)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizationConfig {
    pub frames: FrameConfig,
    pub filter: FilterConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_pose: Option<InitialPose>,
}

impl LocalizationConfig {
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        write_json(self, path.as_ref())
    }
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        read_json(path.as_ref())
    }
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        write_yaml(self, path.as_ref())
    }
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        read_yaml(path.as_ref())
    }
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        write_toml(self, path.as_ref())
    }
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        read_toml(path.as_ref())
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        write_file(self, path.as_ref())
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        read_file(path.as_ref())
    }
}

pub(crate) fn write_json<T: Serialize>(value: &T, path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, value).map_err(io::Error::other)
}
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let file = File::open(path)?;
    serde_json::from_reader(file).map_err(io::Error::other)
}
pub(crate) fn write_yaml<T: Serialize>(value: &T, path: &Path) -> io::Result<()> {
    let mut file = File::create(path)?;
    let s = serde_yaml::to_string(value).map_err(io::Error::other)?;
    file.write_all(s.as_bytes())
}
pub(crate) fn read_yaml<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let file = File::open(path)?;
    serde_yaml::from_reader(file).map_err(io::Error::other)
}
pub(crate) fn write_toml<T: Serialize>(value: &T, path: &Path) -> io::Result<()> {
    let mut file = File::create(path)?;
    let s = toml::to_string(value).map_err(io::Error::other)?;
    file.write_all(s.as_bytes())
}
pub(crate) fn read_toml<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let mut s = String::new();
    let mut file = File::open(path)?;
    file.read_to_string(&mut s)?;
    toml::from_str(&s).map_err(io::Error::other)
}

/// Write `value` in the format named by the file extension.
pub(crate) fn write_file<T: Serialize>(value: &T, path: &Path) -> io::Result<()> {
    match extension_of(path).as_deref() {
        Some("json") => write_json(value, path),
        Some("yaml") | Some("yml") => write_yaml(value, path),
        Some("toml") => write_toml(value, path),
        _ => Err(unsupported_extension()),
    }
}

/// Read a value in the format named by the file extension.
pub(crate) fn read_file<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    match extension_of(path).as_deref() {
        Some("json") => read_json(path),
        Some("yaml") | Some("yml") => read_yaml(path),
        Some("toml") => read_toml(path),
        _ => Err(unsupported_extension()),
    }
}

/// Lower-cased file extension, if any.
fn extension_of(p: &Path) -> Option<String> {
    p.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported_extension() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "unsupported file extension")
}
