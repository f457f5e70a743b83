#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("pod {pod} is Running outside every strategy node group")]
    StrayPod { pod: String },

    #[error("deployment {deployment} has fewer running pods than the {required} the strategies keep; replicas were raised")]
    InsufficientReplicas { deployment: String, required: u32 },

    #[error("failed to update replica count for deployment {deployment}: {source}")]
    ReplicaUpdateFailed {
        deployment: String,
        source: kube::Error,
    },

    #[error("pod {pod} entered the Failed phase before becoming ready")]
    LaunchFailed { pod: String },

    #[error("timed out after {timeout_sec}s waiting for replacement pods to be scheduled")]
    MonitorTimeout { timeout_sec: u32 },

    #[error("restart tick")]
    RestartTick,

    #[error("runner stopped")]
    Stopped,
}
