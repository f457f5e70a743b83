use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    Api, Client,
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
};
use std::collections::BTreeMap;

use crate::util::{Error, MANAGER_NAME};

pub mod cordon;

/// Renders a label map as the `k1=v1,k2=v2` selector string the list API
/// expects.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub async fn get_deployment(
    client: Client,
    namespace: &str,
    name: &str,
) -> Result<Deployment, Error> {
    let api: Api<Deployment> = Api::namespaced(client, namespace);
    Ok(api.get(name).await?)
}

pub async fn get_node(client: Client, name: &str) -> Result<Node, Error> {
    let api: Api<Node> = Api::all(client);
    Ok(api.get(name).await?)
}

pub async fn list_pods_by_labels(
    client: Client,
    namespace: &str,
    labels: &BTreeMap<String, String>,
) -> Result<Vec<Pod>, Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let params = ListParams::default().labels(&label_selector(labels));
    match api.list(&params).await {
        Ok(list) => Ok(list.items),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

pub async fn list_nodes(client: Client) -> Result<Vec<Node>, Error> {
    let api: Api<Node> = Api::all(client);
    match api.list(&ListParams::default()).await {
        Ok(list) => Ok(list.items),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

pub async fn list_nodes_by_labels(
    client: Client,
    labels: &BTreeMap<String, String>,
) -> Result<Vec<Node>, Error> {
    let api: Api<Node> = Api::all(client);
    let params = ListParams::default().labels(&label_selector(labels));
    match api.list(&params).await {
        Ok(list) => Ok(list.items),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

pub async fn delete_pod(client: Client, pod: &Pod) -> Result<(), Error> {
    let name = pod
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("Pod is missing metadata.name".to_string()))?;
    let namespace = pod
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("Pod is missing metadata.namespace".to_string()))?;
    let api: Api<Pod> = Api::namespaced(client, namespace);
    api.delete(name, &DeleteParams::default()).await?;
    Ok(())
}

pub async fn patch_node(
    client: Client,
    name: &str,
    patch: json_patch::Patch,
) -> Result<Node, Error> {
    let api: Api<Node> = Api::all(client);
    Ok(api
        .patch(name, &PatchParams::apply(MANAGER_NAME), &Patch::Json::<Node>(patch))
        .await?)
}

pub async fn update_node(client: Client, node: &Node) -> Result<Node, Error> {
    let name = node
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("Node is missing metadata.name".to_string()))?;
    let api: Api<Node> = Api::all(client);
    Ok(api.replace(name, &PostParams::default(), node).await?)
}

pub async fn update_deployment(client: Client, deployment: &Deployment) -> Result<Deployment, Error> {
    let name = deployment
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("Deployment is missing metadata.name".to_string()))?;
    let namespace = deployment
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("Deployment is missing metadata.namespace".to_string()))?;
    let api: Api<Deployment> = Api::namespaced(client, namespace);
    Ok(api.replace(name, &PostParams::default(), deployment).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_selector_joins_pairs_in_key_order() {
        let labels: BTreeMap<String, String> = [("zone", "a"), ("disk", "ssd")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(label_selector(&labels), "disk=ssd,zone=a");
    }

    #[test]
    fn empty_label_map_selects_everything() {
        assert_eq!(label_selector(&BTreeMap::new()), "");
    }
}
