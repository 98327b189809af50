#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod controller;
pub mod policy;

pub use self::{
    controller::ControllerKind,
    policy::{
        Discovery, MetadataKey, PatternText, PolicyDocument, ServiceSelector, UnknownMetadataKey,
    },
};
pub use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
        batch::v1::{CronJob, Job},
        core::v1::{ConfigMap, Pod, PodTemplateSpec},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, ResourceExt},
    Client, Error, Resource,
};

/// A pod's labels, as exposed by its `ObjectMeta`.
pub type Labels = std::collections::BTreeMap<String, String>;
