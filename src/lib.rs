//! Discovers the container images deployed across a fleet (ECS clusters or
//! Kubernetes namespaces), resolves their registry pull credentials and hands
//! them to a downstream consumer such as a vulnerability scanner.

pub mod backends;
pub mod delivery;
pub mod discovery;
pub mod error;
pub mod image;
pub mod settings;
