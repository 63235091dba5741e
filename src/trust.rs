//! Process-wide store of trusted CA roots.
//!
//! The store is built from the configured PEM file and swapped atomically on
//! reinit. Connections pick up the current store when they are set up.
//! Reinit is not coordinated with connection setup; callers serialise the two.

use std::fs;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;

use crate::certificate::test_cert_key;
use crate::config::Config;
use crate::Error;

pub struct TrustStore {
    roots: Arc<RootCertStore>,
    anchors: Vec<CertificateDer<'static>>,
}

impl TrustStore {
    /// Store with no roots.
    pub fn empty() -> Self {
        TrustStore {
            roots: Arc::new(RootCertStore::empty()),
            anchors: Vec::new(),
        }
    }

    /// Parse every certificate in `pem`. Certificates that fail to parse are
    /// logged and skipped.
    pub fn from_pem(pem: &[u8]) -> Self {
        let mut store = TrustStore::empty();
        for cert in rustls_pemfile::certs(&mut &pem[..]) {
            match cert {
                Ok(der) => store.add(der),
                Err(e) => warn!("Skip unparsable CA PEM block: {}", e),
            }
        }
        store
    }

    /// Add one DER encoded root.
    pub fn add(&mut self, der: CertificateDer<'static>) {
        let roots = Arc::make_mut(&mut self.roots);
        match roots.add(der.clone()) {
            Ok(()) => self.anchors.push(der),
            Err(e) => warn!("Skip invalid CA certificate: {}", e),
        }
    }

    pub fn roots(&self) -> Arc<RootCertStore> {
        self.roots.clone()
    }

    /// Whether `der` is one of the trusted roots.
    pub fn contains(&self, der: &[u8]) -> bool {
        self.anchors.iter().any(|a| a.as_ref() == der)
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

#[derive(Default)]
pub struct TrustManager {
    current: ArcSwapOption<TrustStore>,
}

impl TrustManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the store from `config`.
    ///
    /// Without a CA path the store starts empty. An unreadable file is an
    /// error and leaves no store behind.
    pub fn init_ca_chain(&self, config: &Config) -> Result<(), Error> {
        let mut store = match config.ca_cert_path() {
            Some(path) => {
                let pem = match fs::read(path) {
                    Ok(pem) => pem,
                    Err(e) => {
                        self.current.store(None);
                        return Err(Error::TrustStore(format!(
                            "failed to read {}: {}",
                            path.display(),
                            e
                        )));
                    }
                };
                TrustStore::from_pem(&pem)
            }
            None => TrustStore::empty(),
        };

        if config.use_test_cert_in_ca() {
            let test = test_cert_key()?;
            for der in test.certificates()? {
                store.add(der);
            }
        }

        debug!("Trust store loaded with {} roots", store.len());
        self.current.store(Some(Arc::new(store)));
        Ok(())
    }

    /// Drop the current store and build a new one.
    pub fn reinit_ca_chain(&self, config: &Config) -> Result<(), Error> {
        self.current.store(None);
        self.init_ca_chain(config)
    }

    pub fn current(&self) -> Option<Arc<TrustStore>> {
        self.current.load_full()
    }
}
