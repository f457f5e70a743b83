use super::{Error, MANAGER_NAME};
use baton_types::*;
use kube::{
    Api, Client,
    api::{Patch, PatchParams, Resource},
    core::NamespaceResourceScope,
};
use serde::{Serialize, de::DeserializeOwned};
use std::{clone::Clone, fmt::Debug};

pub trait Object<S> {
    /// Returns a mutable reference to the status object, initializing
    /// it with the default value if it does not exist.
    fn mut_status(&mut self) -> &mut S;
}

impl Object<BatonStatus> for Baton {
    fn mut_status(&mut self) -> &mut BatonStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

/// Patch the resource's status object with the provided function.
/// The function is passed a mutable reference to the status object,
/// which is to be mutated in-place. Move closures are supported.
pub async fn patch_status<S, T>(
    client: Client,
    instance: &T,
    f: impl FnOnce(&mut S),
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource
        + Object<S>
        + Serialize
        + DeserializeOwned
        + Debug
        + Resource<Scope = NamespaceResourceScope>,
{
    let mut modified = instance.clone();
    f(modified.mut_status());
    let patch = json_patch::diff(
        &serde_json::to_value(instance)?,
        &serde_json::to_value(&modified)?,
    );
    let name = instance
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("resource is missing metadata.name".to_string()))?;
    let namespace = instance
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("resource is missing metadata.namespace".to_string()))?;
    let api: Api<T> = Api::namespaced(client, namespace);
    Ok(api
        .patch_status(
            name,
            &PatchParams::apply(MANAGER_NAME),
            &Patch::Json::<T>(patch),
        )
        .await?)
}
