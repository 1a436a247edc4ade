//! OAuth 2.0 client-credentials support
//!
//! Features:
//! - Static client registry (`client_secret_basic` / `client_secret_post`)
//! - Client-credentials grant exchange (RFC 6749 §4.4)
//! - In-memory token cache keyed by registration and principal
//! - Single-flight token acquisition per cache key
//! - OpenID Connect discovery of the issuer's endpoints

mod cache;
mod discovery;
mod grant;
mod manager;
mod registry;

pub use cache::{CacheKey, CacheStats, CachedToken, TokenCache};
pub use discovery::{IssuerEndpoints, ProviderMetadata, well_known_url};
pub use grant::{GrantError, GrantExchanger, GrantedToken, HttpGrantExchanger};
pub use manager::{AuthError, AuthorizeRequest, AuthorizedClientManager};
pub use registry::{ClientAuthMethod, ClientRegistration, ClientRegistry};
