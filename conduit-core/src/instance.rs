//! Per-instance configuration derived from a shared template.

use std::path::{Component, Path, PathBuf};

use crate::config::{BandwidthLimit, MaxClients, NetworkConfigSource};
use crate::tracing_setup::LogLevel;

/// Parameters identical across every instance of one run.
///
/// Limits apply to each instance independently; they are not divided
/// among instances.
#[derive(Debug, Clone)]
pub struct SharedInstanceSettings {
    pub network_config: NetworkConfigSource,
    pub max_clients: MaxClients,
    pub bandwidth: BandwidthLimit,
    /// Stats filename pattern, e.g. `stats.json`
    pub stats_pattern: Option<String>,
    pub verbosity: LogLevel,
}

/// Fully resolved configuration owned by exactly one running instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceConfig {
    index: usize,
    pub data_dir: PathBuf,
    pub network_config: NetworkConfigSource,
    pub max_clients: MaxClients,
    pub bandwidth: BandwidthLimit,
    pub stats_file: Option<PathBuf>,
    pub verbosity: LogLevel,
}

impl InstanceConfig {
    /// Derives the configuration of instance `index` under `base_dir`.
    ///
    /// Pure construction: nothing is created on disk.
    pub fn build(base_dir: &Path, index: usize, shared: &SharedInstanceSettings) -> Self {
        let stats_file = shared
            .stats_pattern
            .as_deref()
            .filter(|pattern| !pattern.is_empty())
            .map(|pattern| base_dir.join(under_base(&instance_stats_name(pattern, index))));

        Self {
            index,
            data_dir: base_dir.join(format!("instance-{index}")),
            network_config: shared.network_config.clone(),
            max_clients: shared.max_clients,
            bandwidth: shared.bandwidth,
            stats_file,
            verbosity: shared.verbosity,
        }
    }

    /// Builds configurations for indices `0..count`, in order.
    pub fn build_all(base_dir: &Path, count: usize, shared: &SharedInstanceSettings) -> Vec<Self> {
        (0..count)
            .map(|index| Self::build(base_dir, index, shared))
            .collect()
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// `stats.json` + 2 -> `stats-instance-2.json`
fn instance_stats_name(pattern: &str, index: usize) -> String {
    let (stem, extension) = split_extension(pattern);
    format!("{stem}-instance-{index}{extension}")
}

/// Keeps only the normal components of `name`, so an absolute or
/// parent-relative pattern still resolves inside the base directory.
fn under_base(name: &str) -> PathBuf {
    Path::new(name)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

/// Splits at the last dot of the final path component.
fn split_extension(pattern: &str) -> (&str, &str) {
    let name_start = pattern
        .rfind(std::path::is_separator)
        .map_or(0, |pos| pos + 1);

    match pattern[name_start..].rfind('.') {
        Some(dot) => pattern.split_at(name_start + dot),
        None => (pattern, ""),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    fn shared(stats_pattern: Option<&str>) -> SharedInstanceSettings {
        SharedInstanceSettings {
            network_config: NetworkConfigSource::Embedded,
            max_clients: MaxClients::new(100).unwrap(),
            bandwidth: BandwidthLimit::Unlimited,
            stats_pattern: stats_pattern.map(str::to_string),
            verbosity: LogLevel::Info,
        }
    }

    #[test]
    fn test_four_instances_with_stats_pattern() {
        let base = Path::new("/tmp/x");
        let configs = InstanceConfig::build_all(base, 4, &shared(Some("stats.json")));

        assert_eq!(configs.len(), 4);
        for (i, config) in configs.iter().enumerate() {
            assert_eq!(config.index(), i);
            assert_eq!(config.data_dir, PathBuf::from(format!("/tmp/x/instance-{i}")));
            assert_eq!(
                config.stats_file,
                Some(PathBuf::from(format!("/tmp/x/stats-instance-{i}.json")))
            );
        }
    }

    #[test]
    fn test_single_instance_without_pattern() {
        let configs = InstanceConfig::build_all(Path::new("/data"), 1, &shared(None));

        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].stats_file, None);
        assert_eq!(configs[0].data_dir, PathBuf::from("/data/instance-0"));
    }

    #[test]
    fn test_empty_pattern_produces_no_stats_file() {
        let config = InstanceConfig::build(Path::new("/data"), 3, &shared(Some("")));
        assert_eq!(config.stats_file, None);
    }

    #[test]
    fn test_shared_values_copied_verbatim() {
        let settings = shared(Some("stats.json"));
        let config = InstanceConfig::build(Path::new("/data"), 7, &settings);

        assert_eq!(config.max_clients, settings.max_clients);
        assert_eq!(config.bandwidth, settings.bandwidth);
        assert_eq!(config.network_config, settings.network_config);
        assert_eq!(config.verbosity, settings.verbosity);
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("stats.json"), ("stats", ".json"));
        assert_eq!(split_extension("stats"), ("stats", ""));
        assert_eq!(split_extension("a.b.json"), ("a.b", ".json"));
        assert_eq!(split_extension("dir.d/stats"), ("dir.d/stats", ""));
        assert_eq!(split_extension(".json"), ("", ".json"));
    }

    #[test]
    fn test_pattern_without_extension() {
        let config = InstanceConfig::build(Path::new("/data"), 2, &shared(Some("stats")));
        assert_eq!(
            config.stats_file,
            Some(PathBuf::from("/data/stats-instance-2"))
        );
    }

    #[test]
    fn test_absolute_pattern_stays_under_base() {
        let config = InstanceConfig::build(
            Path::new("/srv/base"),
            0,
            &shared(Some("/var/tmp/stats.json")),
        );
        assert_eq!(
            config.stats_file,
            Some(PathBuf::from("/srv/base/var/tmp/stats-instance-0.json"))
        );
    }

    #[test]
    fn test_parent_components_are_dropped() {
        let config = InstanceConfig::build(Path::new("/srv/base"), 1, &shared(Some("../stats.json")));
        assert_eq!(
            config.stats_file,
            Some(PathBuf::from("/srv/base/stats-instance-1.json"))
        );
    }

    #[test]
    fn test_paths_distinct_for_every_count() {
        let base = Path::new("/srv/conduit");
        let settings = shared(Some("stats.json"));

        for count in 1..=32 {
            let configs = InstanceConfig::build_all(base, count, &settings);
            let data_dirs: HashSet<_> = configs.iter().map(|c| c.data_dir.clone()).collect();
            let stats_files: HashSet<_> = configs.iter().map(|c| c.stats_file.clone()).collect();

            assert_eq!(data_dirs.len(), count);
            assert_eq!(stats_files.len(), count);
        }
    }

    proptest! {
        #[test]
        fn prop_stats_files_stay_distinct(
            count in 1usize..=32,
            stem in "/?[a-z][a-z0-9_./-]{0,12}",
        ) {
            let configs = InstanceConfig::build_all(Path::new("/data"), count, &shared(Some(&stem)));
            let stats_files: HashSet<_> = configs.iter().map(|c| c.stats_file.clone()).collect();

            prop_assert_eq!(stats_files.len(), count);
            for config in &configs {
                let stats_file = config.stats_file.as_ref().unwrap();
                prop_assert!(stats_file.starts_with("/data"));
                prop_assert_ne!(stats_file, &config.data_dir);
            }
        }
    }
}
