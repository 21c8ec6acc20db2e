use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::debug;

use crate::errors::{HarvestError, Result};
use crate::tree::{Node, yaml};

/// Cluster software version `major.minor.patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version(pub u32, pub u32, pub u32);

impl FromStr for Version {
    type Err = HarvestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = [0u32; 3];
        let mut count = 0;
        for (i, p) in s.trim().split('.').enumerate() {
            if i >= 3 {
                return Err(HarvestError::Parse(format!("version [{}]", s)));
            }
            parts[i] = p
                .parse()
                .map_err(|_| HarvestError::Parse(format!("version [{}]", s)))?;
            count += 1;
        }
        if count == 0 {
            return Err(HarvestError::Parse(format!("version [{}]", s)));
        }
        Ok(Version(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterModel {
    Clustered,
    SevenMode,
}

impl ClusterModel {
    /// Name of the template sub-directory for this model.
    pub fn dir_name(self) -> &'static str {
        match self {
            ClusterModel::Clustered => "cdot",
            ClusterModel::SevenMode => "7mode",
        }
    }
}

/// Highest available version not above `cluster`, else the lowest above it.
pub fn pick_version(available: &[Version], cluster: Version) -> Option<Version> {
    available
        .iter()
        .filter(|v| **v <= cluster)
        .max()
        .or_else(|| available.iter().filter(|v| **v > cluster).min())
        .copied()
}

/// Template files under `<root>/<collector>/`.
///
/// ```text
/// conf/
///   zapi/
///     default.yaml
///     cdot/
///       9.8.0/volume.yaml
///       9.10.0/volume.yaml
///     7mode/
///       8.2.5/volume.yaml
/// ```
#[derive(Debug, Clone)]
pub struct TemplateStore {
    root: PathBuf,
}

impl TemplateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collector_dir(&self, collector: &str) -> PathBuf {
        self.root.join(collector.to_lowercase())
    }

    /// Loads `default.yaml` of a collector.
    pub fn default_template(&self, collector: &str) -> Result<Node> {
        let path = self.collector_dir(collector).join("default.yaml");
        yaml::load(&path)
    }

    /// Version directories present for `collector` and `model`, sorted by
    /// version. Each entry keeps the directory name as found on disk
    /// (`9.8` and `9.8.0` both parse to the same version).
    pub fn versions(&self, collector: &str, model: ClusterModel) -> Result<Vec<(Version, String)>> {
        let dir = self.collector_dir(collector).join(model.dir_name());
        let entries = std::fs::read_dir(&dir).map_err(|e| {
            HarvestError::Template(format!("read dir [{}]: {}", dir.display(), e))
        })?;
        let mut versions = Vec::new();
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if let Ok(v) = name.parse::<Version>() {
                versions.push((v, name));
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Loads the sub-template `file` from the best matching version directory.
    pub fn sub_template(
        &self,
        collector: &str,
        model: ClusterModel,
        cluster: Version,
        file: &str,
    ) -> Result<Node> {
        let versions = self.versions(collector, model)?;
        let available: Vec<Version> = versions.iter().map(|(v, _)| *v).collect();
        let picked = pick_version(&available, cluster).ok_or_else(|| {
            HarvestError::Template(format!(
                "no {} template directory for [{}]",
                model.dir_name(),
                collector
            ))
        })?;
        let dir_name = versions
            .iter()
            .find(|(v, _)| *v == picked)
            .map(|(_, name)| name.as_str())
            .unwrap_or_default();
        let path = self
            .collector_dir(collector)
            .join(model.dir_name())
            .join(dir_name)
            .join(file);
        debug!(
            collector,
            cluster = %cluster,
            picked = %picked,
            path = %path.display(),
            "selected sub-template"
        );
        yaml::load(&path)
    }

    /// Default template of `collector` overlaid with the object sub-template.
    pub fn resolve(
        &self,
        collector: &str,
        model: ClusterModel,
        cluster: Version,
        file: &str,
    ) -> Result<Node> {
        let mut template = self.default_template(collector)?;
        let sub = self.sub_template(collector, model, cluster, file)?;
        template.overlay(&sub);
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn version_ordering() {
        assert!(v("9.10.0") > v("9.8.0"));
        assert_eq!(v("9.8"), Version(9, 8, 0));
        assert!("9.x.0".parse::<Version>().is_err());
        assert!("".parse::<Version>().is_err());
    }

    #[test]
    fn pick_highest_not_above_cluster() {
        let available = vec![v("9.6.0"), v("9.8.0"), v("9.10.0")];
        assert_eq!(pick_version(&available, v("9.9.1")), Some(v("9.8.0")));
        assert_eq!(pick_version(&available, v("9.10.0")), Some(v("9.10.0")));
        assert_eq!(pick_version(&available, v("9.12.1")), Some(v("9.10.0")));
    }

    #[test]
    fn pick_lowest_above_when_cluster_is_older() {
        let available = vec![v("9.8.0"), v("9.6.0")];
        assert_eq!(pick_version(&available, v("9.1.0")), Some(v("9.6.0")));
        assert_eq!(pick_version(&[], v("9.1.0")), None);
    }

    #[test]
    fn resolve_overlays_sub_template() {
        let dir = tempfile::tempdir().unwrap();
        let zapi = dir.path().join("zapi");
        std::fs::create_dir_all(zapi.join("cdot/9.8.0")).unwrap();
        std::fs::create_dir_all(zapi.join("cdot/9.10.0")).unwrap();
        std::fs::write(
            zapi.join("default.yaml"),
            "collector: Zapi\nschedule:\n  - instance: 600s\n  - data: 180s\n",
        )
        .unwrap();
        std::fs::write(
            zapi.join("cdot/9.8.0/volume.yaml"),
            "object: volume\nschedule:\n  - data: 60s\n",
        )
        .unwrap();
        std::fs::write(zapi.join("cdot/9.10.0/volume.yaml"), "object: volume_new\n").unwrap();

        let store = TemplateStore::new(dir.path());
        let t = store
            .resolve("Zapi", ClusterModel::Clustered, v("9.9.1"), "volume.yaml")
            .unwrap();
        assert_eq!(t.child_content("collector"), "Zapi");
        assert_eq!(t.child_content("object"), "volume");
        let schedule = t.child("schedule").unwrap();
        assert_eq!(schedule.child_content("data"), "60s");
        assert!(!schedule.has_child("instance"));

        assert!(
            store
                .resolve("Zapi", ClusterModel::SevenMode, v("8.2.5"), "volume.yaml")
                .is_err()
        );
    }

    #[test]
    fn two_part_version_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cdot = dir.path().join("zapi").join("cdot");
        std::fs::create_dir_all(cdot.join("9.8")).unwrap();
        std::fs::create_dir_all(cdot.join("9.6.0")).unwrap();
        std::fs::write(cdot.join("9.8/volume.yaml"), "object: volume\n").unwrap();
        std::fs::write(cdot.join("9.6.0/volume.yaml"), "object: volume_old\n").unwrap();

        let store = TemplateStore::new(dir.path());
        let versions = store.versions("Zapi", ClusterModel::Clustered).unwrap();
        assert_eq!(
            versions,
            vec![(v("9.6.0"), "9.6.0".to_string()), (v("9.8.0"), "9.8".to_string())]
        );
        let t = store
            .sub_template("Zapi", ClusterModel::Clustered, v("9.9.1"), "volume.yaml")
            .unwrap();
        assert_eq!(t.child_content("object"), "volume");
    }
}
