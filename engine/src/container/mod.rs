//! Container Sandbox (C1, spec §4.1) and Network Policy (C2, spec §4.2).

pub mod network;
pub mod sandbox;

pub use network::{build_firewall_script, ensure_network, NetworkPolicy};
pub use sandbox::{AgentSandbox, DockerSandbox, ExecOutcome, SandboxHandle};
