//! Pagesgate TLS Module
//!
//! On-demand certificates for the pages gateway:
//! - Certificate resolution during the TLS handshake
//! - ACME issuance and renewal (Let's Encrypt or any ACME CA)
//! - Certificate storage, rate limiting and background maintenance

pub mod account;
pub mod acme;
pub mod cache;
pub mod cert_store;
pub mod challenge;
pub mod dns;
pub mod maintainer;
pub mod manager;
pub mod mock;
pub mod obtain_lock;
pub mod rate_limit;
pub mod resolver;
pub mod tls;

pub use acme::{AcmeClient, AcmeError, CertificateAuthority, ChallengeType};
pub use cache::{ChallengeCache, TtlCache};
pub use cert_store::{
    CertStore, CertStoreError, CertificateOrigin, CertificateResource, FileCertStore,
    MemoryCertStore, open_store,
};
pub use challenge::{ChallengeHandler, ChallengeResponse};
pub use maintainer::Maintainer;
pub use manager::{CertError, CertificateManager, ObtainRequest};
pub use resolver::{CertResolver, DomainAuthority, DomainClaim, ResolveError, StaticDomainAuthority};
pub use tls::{TlsAcceptor, TlsError, install_crypto_provider};
