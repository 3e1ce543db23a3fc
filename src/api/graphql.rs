use async_graphql::{Context, EmptySubscription, Object, Schema, SimpleObject};
use std::sync::Arc;

use crate::domain::mesh::ConnectivityMatrix;
use crate::domain::mesh_service::MeshService;
use crate::domain::node::Node;
use crate::domain::rules::FirewallRule;
use crate::domain::types::*;

pub type MeshguardSchema = Schema<QueryRoot, MutationRoot, EmptySubscription>;

/// One source row of the connectivity matrix.
#[derive(Debug, Clone, SimpleObject)]
pub struct MatrixRow {
    pub source: String,
    pub targets: Vec<MatrixCell>,
}

#[derive(Debug, Clone, SimpleObject)]
pub struct MatrixCell {
    pub target: String,
    pub connected: bool,
}

fn matrix_rows(matrix: ConnectivityMatrix) -> Vec<MatrixRow> {
    matrix
        .into_iter()
        .map(|(source, row)| MatrixRow {
            source,
            targets: row
                .into_iter()
                .map(|(target, connected)| MatrixCell { target, connected })
                .collect(),
        })
        .collect()
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    async fn health(&self, ctx: &Context<'_>) -> async_graphql::Result<DaemonHealth> {
        let svc = ctx.data::<Arc<MeshService>>()?;
        Ok(svc.health().await)
    }

    async fn nodes(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<Node>> {
        let svc = ctx.data::<Arc<MeshService>>()?;
        Ok(svc.nodes())
    }

    /// Who reaches whom, as of the latest probing pass.
    async fn matrix(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<MatrixRow>> {
        let svc = ctx.data::<Arc<MeshService>>()?;
        Ok(matrix_rows(svc.matrix().await))
    }

    async fn connectivity(
        &self,
        ctx: &Context<'_>,
    ) -> async_graphql::Result<Vec<ConnectivityResult>> {
        let svc = ctx.data::<Arc<MeshService>>()?;
        Ok(svc.connectivity().await)
    }

    async fn firewall_results(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<FirewallResult>> {
        let svc = ctx.data::<Arc<MeshService>>()?;
        Ok(svc.firewall_results().await)
    }

    /// Rules the node would receive; null for nodes outside the inventory.
    async fn rules(
        &self,
        ctx: &Context<'_>,
        node: String,
    ) -> async_graphql::Result<Option<Vec<FirewallRule>>> {
        let svc = ctx.data::<Arc<MeshService>>()?;
        Ok(svc.rules_for(&node))
    }
}

pub struct MutationRoot;

#[Object]
impl MutationRoot {
    /// Run a full mesh verification and wait for its outcome.
    async fn verify_mesh(&self, ctx: &Context<'_>) -> async_graphql::Result<RunOutcome> {
        let svc = ctx.data::<Arc<MeshService>>()?;
        Ok(svc.verify_mesh().await)
    }

    async fn configure_firewall(&self, ctx: &Context<'_>) -> async_graphql::Result<RunOutcome> {
        let svc = ctx.data::<Arc<MeshService>>()?;
        Ok(svc.configure_firewall().await)
    }
}

pub fn build_schema(mesh_service: Arc<MeshService>) -> MeshguardSchema {
    Schema::build(QueryRoot, MutationRoot, EmptySubscription)
        .data(mesh_service)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::domain::firewall::FirewallManager;
    use crate::domain::mesh::{MeshSettings, MeshVerifier};
    use crate::domain::node::NodeRegistry;
    use crate::domain::remote::SshExecutor;
    use crate::domain::rules::RuleSelector;

    fn schema() -> MeshguardSchema {
        let mut registry = NodeRegistry::new();
        registry
            .add_node(Node::new("master-1", "192.0.2.1", "10.8.0.1").with_role("controlplane,etcd"))
            .unwrap();
        registry
            .add_node(Node::new("worker-1", "192.0.2.2", "10.8.0.2").with_role("worker"))
            .unwrap();
        let exec = Arc::new(SshExecutor::new(Duration::from_secs(1), Duration::from_secs(1)));
        build_schema(Arc::new(MeshService::new(
            MeshVerifier::with_registry(exec.clone(), MeshSettings::default(), registry.clone()),
            FirewallManager::with_registry(exec, RuleSelector::default(), Duration::from_secs(1), registry),
        )))
    }

    #[tokio::test]
    async fn nodes_expose_roles() {
        let res = schema().execute("{ nodes { name wireguardIp roles } }").await;
        assert!(res.errors.is_empty(), "{:?}", res.errors);
        let data = res.data.into_json().unwrap();
        assert_eq!(data["nodes"][0]["name"], "master-1");
        assert_eq!(data["nodes"][0]["roles"][0], "CONTROLPLANE");
        assert_eq!(data["nodes"][1]["wireguardIp"], "10.8.0.2");
    }

    #[tokio::test]
    async fn rules_query_by_node() {
        let res = schema()
            .execute(r#"{ rules(node: "worker-1") { port protocol source } ghost: rules(node: "ghost") { port } }"#)
            .await;
        assert!(res.errors.is_empty(), "{:?}", res.errors);
        let data = res.data.into_json().unwrap();
        let ports: Vec<&str> = data["rules"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["port"].as_str().unwrap())
            .collect();
        assert!(ports.contains(&"30000:32767"));
        assert!(data["ghost"].is_null());
    }

    #[tokio::test]
    async fn matrix_has_a_row_per_node() {
        let res = schema().execute("{ matrix { source targets { target connected } } }").await;
        assert!(res.errors.is_empty(), "{:?}", res.errors);
        let data = res.data.into_json().unwrap();
        assert_eq!(data["matrix"].as_array().unwrap().len(), 2);
        assert_eq!(data["matrix"][0]["targets"].as_array().unwrap().len(), 0);
    }
}
