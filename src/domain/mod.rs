pub mod error;
pub(crate) mod fanout;
pub mod firewall;
pub mod firewall_script;
pub mod mesh;
pub mod mesh_service;
pub mod node;
pub mod probe;
pub mod remote;
pub mod rules;
pub mod types;
