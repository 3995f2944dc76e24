//! Provider trees described in YAML
//!
//! ```yaml
//! type: read_ahead
//! read_ahead_range_ms: 200
//! children:
//!   - type: combined
//!     children:
//!       - provider: { type: bag, path: /data/run_1 }
//!       - prefix: /webviz_bag_2
//!         provider: { type: streamed_bag, path: /data/run_2.mcap }
//! ```

use crate::error::{PlaybackError, Result};
use crate::filelike::LocalFileReader;
use crate::providers::bag::{BagSource, DEFAULT_CACHE_SIZE_BYTES};
use crate::providers::memory_cache;
use crate::providers::{
    BagDataProvider, CombinedDataProvider, DataProvider, MemoryCacheDataProvider, PrefixedChild,
    ReadAheadDataProvider, RpcDataProvider,
};
use crate::time::Time;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// One node of a provider tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// A bag directory
    Bag {
        path: PathBuf,
        /// Always empty for a valid tree
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        children: Vec<ProviderConfig>,
    },
    /// A single MCAP file read through the range cache
    StreamedBag {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_size_bytes: Option<u64>,
    },
    Combined { children: Vec<CombinedChildConfig> },
    ReadAhead {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        read_ahead_range_ms: Option<u64>,
        children: Vec<ProviderConfig>,
    },
    /// Keep the single child's messages in memory, block by block
    MemoryCache {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_size_bytes: Option<u64>,
        /// Never evict; wins over `cache_size_bytes`
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        unlimited_cache: bool,
        children: Vec<ProviderConfig>,
    },
    /// Run the single child on a worker thread
    Worker { children: Vec<ProviderConfig> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedChildConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    pub provider: ProviderConfig,
}

impl ProviderConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yml::from_str(content)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Instantiate the tree
    pub fn build(&self) -> Result<Arc<dyn DataProvider>> {
        debug!(config = ?self, "building provider");
        let provider: Arc<dyn DataProvider> = match self {
            ProviderConfig::Bag { path, children } => {
                let children = build_all(children)?;
                Arc::new(BagDataProvider::new(BagSource::Directory(path.clone()), children)?)
            }
            ProviderConfig::StreamedBag {
                path,
                cache_size_bytes,
            } => Arc::new(BagDataProvider::streamed(
                Arc::new(LocalFileReader::new(path.clone())),
                cache_size_bytes.unwrap_or(DEFAULT_CACHE_SIZE_BYTES),
            )),
            ProviderConfig::Combined { children } => {
                let children = children
                    .iter()
                    .map(|child| {
                        Ok(PrefixedChild {
                            prefix: child.prefix.clone(),
                            provider: child.provider.build()?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Arc::new(CombinedDataProvider::new(children)?)
            }
            ProviderConfig::ReadAhead {
                read_ahead_range_ms,
                children,
            } => {
                let mut provider = ReadAheadDataProvider::new(build_all(children)?)?;
                if let Some(millis) = read_ahead_range_ms {
                    let millis = i64::try_from(*millis).map_err(|_| {
                        PlaybackError::configuration(format!("read-ahead range too large: {millis}ms"))
                    })?;
                    provider = provider.with_read_ahead_range(Time::from_millis(millis));
                }
                Arc::new(provider)
            }
            ProviderConfig::MemoryCache {
                cache_size_bytes,
                unlimited_cache,
                children,
            } => {
                let budget = match (unlimited_cache, cache_size_bytes) {
                    (true, _) => None,
                    (false, bytes) => Some(bytes.unwrap_or(memory_cache::DEFAULT_CACHE_SIZE_BYTES)),
                };
                Arc::new(
                    MemoryCacheDataProvider::new(build_all(children)?)?.with_cache_size_bytes(budget),
                )
            }
            ProviderConfig::Worker { children } => {
                let [child] = children.as_slice() else {
                    return Err(PlaybackError::configuration(format!(
                        "Incorrect number of children to worker: {}",
                        children.len()
                    )));
                };
                Arc::new(RpcDataProvider::spawn(child.build()?)?)
            }
        };
        Ok(provider)
    }
}

fn build_all(configs: &[ProviderConfig]) -> Result<Vec<Arc<dyn DataProvider>>> {
    configs.iter().map(ProviderConfig::build).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_nested_tree() {
        let yaml = r#"
type: read_ahead
read_ahead_range_ms: 250
children:
  - type: combined
    children:
      - provider: { type: bag, path: /data/first }
      - prefix: /webviz_bag_2
        provider:
          type: streamed_bag
          path: /data/second.mcap
          cache_size_bytes: 1024
"#;
        let config = ProviderConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config,
            ProviderConfig::ReadAhead {
                read_ahead_range_ms: Some(250),
                children: vec![ProviderConfig::Combined {
                    children: vec![
                        CombinedChildConfig {
                            prefix: None,
                            provider: ProviderConfig::Bag {
                                path: PathBuf::from("/data/first"),
                                children: Vec::new(),
                            },
                        },
                        CombinedChildConfig {
                            prefix: Some("/webviz_bag_2".to_string()),
                            provider: ProviderConfig::StreamedBag {
                                path: PathBuf::from("/data/second.mcap"),
                                cache_size_bytes: Some(1024),
                            },
                        },
                    ],
                }],
            }
        );
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(ProviderConfig::from_yaml("type: carrier_pigeon\n").is_err());
    }

    #[test]
    fn bag_with_children_is_a_configuration_error() {
        let config = ProviderConfig::Bag {
            path: PathBuf::from("/data/first"),
            children: vec![ProviderConfig::Bag {
                path: PathBuf::from("/data/second"),
                children: Vec::new(),
            }],
        };
        assert!(matches!(config.build(), Err(PlaybackError::Configuration { .. })));
    }

    #[test]
    fn parses_memory_cache_node() {
        let yaml = r#"
type: memory_cache
unlimited_cache: true
children:
  - type: bag
    path: /data/first
"#;
        assert_eq!(
            ProviderConfig::from_yaml(yaml).unwrap(),
            ProviderConfig::MemoryCache {
                cache_size_bytes: None,
                unlimited_cache: true,
                children: vec![ProviderConfig::Bag {
                    path: PathBuf::from("/data/first"),
                    children: Vec::new(),
                }],
            }
        );

        let bounded = ProviderConfig::from_yaml(
            "type: memory_cache\ncache_size_bytes: 1000\nchildren: [{ type: bag, path: /data/first }]\n",
        )
        .unwrap();
        assert!(bounded.build().is_ok());
    }

    #[test]
    fn memory_cache_needs_one_child() {
        let config = ProviderConfig::MemoryCache {
            cache_size_bytes: None,
            unlimited_cache: false,
            children: Vec::new(),
        };
        assert!(matches!(config.build(), Err(PlaybackError::Configuration { .. })));
    }

    #[test]
    fn read_ahead_needs_one_child() {
        let config = ProviderConfig::ReadAhead {
            read_ahead_range_ms: None,
            children: Vec::new(),
        };
        assert!(matches!(config.build(), Err(PlaybackError::Configuration { .. })));
    }

    #[test]
    fn combined_validates_prefixes() {
        let bag = |path: &str| ProviderConfig::Bag {
            path: PathBuf::from(path),
            children: Vec::new(),
        };
        let config = ProviderConfig::Combined {
            children: vec![
                CombinedChildConfig {
                    prefix: Some("no_slash".to_string()),
                    provider: bag("/a"),
                },
                CombinedChildConfig {
                    prefix: None,
                    provider: bag("/b"),
                },
            ],
        };
        assert!(matches!(config.build(), Err(PlaybackError::InvalidPrefix { .. })));
    }

    #[test]
    fn worker_needs_one_child() {
        let config = ProviderConfig::Worker { children: Vec::new() };
        assert!(matches!(config.build(), Err(PlaybackError::Configuration { .. })));
    }
}
