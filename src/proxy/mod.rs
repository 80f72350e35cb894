//! File-backed collaborators used by the binary
//!
//! - [`SelfSignedAuthority`] issues the shared certificate with `rcgen`
//! - [`HtpasswdStore`] keeps one basic-auth file per service
//! - [`NginxConfigurer`] writes one site file per service and reloads nginx

mod htpasswd;
mod nginx;
mod self_signed;

pub use htpasswd::{ssha_entry, verify_ssha_entry, HtpasswdStore};
pub use nginx::{render_site, run_command, NginxConfigurer};
pub use self_signed::{SelfSignedAuthority, FFDHE2048_PEM};
