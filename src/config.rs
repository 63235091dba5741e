use std::path::{Path, PathBuf};

use crate::Error;

/// Largest datagram the engine moves in one piece.
pub const DEFAULT_MAX_DGRAM: usize = 2000;

const MIN_RECORD_SIZE: usize = 64;
const MAX_RECORD_SIZE: usize = 16384;

/// TLS engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    ciphers: Vec<String>,
    record_size: Option<usize>,
    record_split_size: Option<usize>,
    max_pipelines: Option<usize>,
    ca_cert_path: Option<PathBuf>,
    use_test_cert_in_ca: bool,
    max_dgram: usize,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            ciphers: Vec::new(),
            record_size: None,
            record_split_size: None,
            max_pipelines: None,
            ca_cert_path: None,
            use_test_cert_in_ca: false,
            max_dgram: DEFAULT_MAX_DGRAM,
        }
    }

    /// Allowed cipher suites, by name.
    ///
    /// Empty means the engine defaults.
    #[inline(always)]
    pub fn ciphers(&self) -> &[String] {
        &self.ciphers
    }

    /// Max plaintext bytes per record.
    #[inline(always)]
    pub fn record_size(&self) -> Option<usize> {
        self.record_size
    }

    /// Size at which writes are split into pipelined records.
    #[inline(always)]
    pub fn record_split_size(&self) -> Option<usize> {
        self.record_split_size
    }

    /// Max records encrypted in parallel.
    #[inline(always)]
    pub fn max_pipelines(&self) -> Option<usize> {
        self.max_pipelines
    }

    /// PEM file with the trusted CA chain.
    #[inline(always)]
    pub fn ca_cert_path(&self) -> Option<&Path> {
        self.ca_cert_path.as_deref()
    }

    /// Whether the built-in test certificate is added to the trust store.
    #[inline(always)]
    pub fn use_test_cert_in_ca(&self) -> bool {
        self.use_test_cert_in_ca
    }

    /// Largest datagram payload, also the size of the per-worker scratch buffers.
    #[inline(always)]
    pub fn max_dgram(&self) -> usize {
        self.max_dgram
    }

    /// Start a builder from this configuration.
    pub fn to_builder(&self) -> ConfigBuilder {
        ConfigBuilder {
            ciphers: self.ciphers.clone(),
            record_size: self.record_size,
            record_split_size: self.record_split_size,
            max_pipelines: self.max_pipelines,
            ca_cert_path: self.ca_cert_path.clone(),
            use_test_cert_in_ca: self.use_test_cert_in_ca,
            max_dgram: self.max_dgram,
        }
    }
}

/// Builder for TLS engine configuration.
pub struct ConfigBuilder {
    ciphers: Vec<String>,
    record_size: Option<usize>,
    record_split_size: Option<usize>,
    max_pipelines: Option<usize>,
    ca_cert_path: Option<PathBuf>,
    use_test_cert_in_ca: bool,
    max_dgram: usize,
}

impl ConfigBuilder {
    /// Set the cipher list.
    ///
    /// Accepts a colon separated list of suite names. An empty string restores
    /// the engine defaults.
    pub fn ciphers(mut self, list: &str) -> Self {
        self.ciphers = parse_cipher_list(list);
        self
    }

    /// Set the max plaintext bytes per record.
    ///
    /// Must be between 64 and 16384. Defaults to the engine's choice.
    pub fn record_size(mut self, size: usize) -> Self {
        self.record_size = Some(size);
        self
    }

    /// Set the record split size.
    pub fn record_split_size(mut self, size: usize) -> Self {
        self.record_split_size = Some(size);
        self
    }

    /// Set the max number of pipelines.
    pub fn max_pipelines(mut self, n: usize) -> Self {
        self.max_pipelines = Some(n);
        self
    }

    /// Set the PEM file the trust store is loaded from.
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    /// Add the built-in test certificate to the trust store.
    ///
    /// Defaults to false.
    pub fn use_test_cert_in_ca(mut self, enable: bool) -> Self {
        self.use_test_cert_in_ca = enable;
        self
    }

    /// Set the largest datagram payload.
    ///
    /// Defaults to 2000.
    pub fn max_dgram(mut self, size: usize) -> Self {
        self.max_dgram = size;
        self
    }

    /// Build the configuration.
    ///
    /// Returns `Error::Config` for out of range record tuning.
    pub fn build(self) -> Result<Config, Error> {
        if let Some(size) = self.record_size {
            if !(MIN_RECORD_SIZE..=MAX_RECORD_SIZE).contains(&size) {
                return Err(Error::Config(format!(
                    "record size {} outside {}..={}",
                    size, MIN_RECORD_SIZE, MAX_RECORD_SIZE
                )));
            }
        }
        if let (Some(split), Some(size)) = (self.record_split_size, self.record_size) {
            if split > size {
                return Err(Error::Config(format!(
                    "record split size {} above record size {}",
                    split, size
                )));
            }
        }
        if self.max_pipelines == Some(0) {
            return Err(Error::Config("max pipelines must be at least 1".into()));
        }
        if self.max_dgram == 0 {
            return Err(Error::Config("max datagram size must be positive".into()));
        }

        Ok(Config {
            ciphers: self.ciphers,
            record_size: self.record_size,
            record_split_size: self.record_split_size,
            max_pipelines: self.max_pipelines,
            ca_cert_path: self.ca_cert_path,
            use_test_cert_in_ca: self.use_test_cert_in_ca,
            max_dgram: self.max_dgram,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ciphers: Vec::new(),
            record_size: None,
            record_split_size: None,
            max_pipelines: None,
            ca_cert_path: None,
            use_test_cert_in_ca: false,
            max_dgram: DEFAULT_MAX_DGRAM,
        }
    }
}

fn parse_cipher_list(list: &str) -> Vec<String> {
    list.split(':')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Hardware offload engine selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffloadSettings {
    engine: Option<String>,
    algorithm: Option<String>,
    async_mode: bool,
}

impl OffloadSettings {
    /// Name the engine, the algorithm class it handles and whether operations
    /// run asynchronously.
    ///
    /// The algorithm is upper-cased. Without an engine async mode is off.
    pub fn new(engine: Option<&str>, algorithm: Option<&str>, async_mode: bool) -> Self {
        let engine = engine.filter(|e| !e.is_empty()).map(str::to_owned);
        OffloadSettings {
            async_mode: async_mode && engine.is_some(),
            engine,
            algorithm: algorithm.map(str::to_uppercase),
        }
    }

    #[inline(always)]
    pub fn engine(&self) -> Option<&str> {
        self.engine.as_deref()
    }

    #[inline(always)]
    pub fn algorithm(&self) -> Option<&str> {
        self.algorithm.as_deref()
    }

    #[inline(always)]
    pub fn async_mode(&self) -> bool {
        self.async_mode
    }
}
