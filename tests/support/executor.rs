use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use nodebalancer::{CallExecutor, CallPayload, ExecuteFuture, NodeTarget, ProbeFuture};
use serde_json::{json, Value};
use tokio::sync::Semaphore;

#[derive(Clone)]
enum Behaviour {
    Respond { delay: Duration },
    Fail,
    Hold,
}

struct Endpoint {
    behaviour: Behaviour,
    calls: usize,
}

/// Executor scripted per endpoint. Unscripted endpoints answer at once with
/// their own endpoint string; every probe succeeds unless the endpoint is
/// scripted to fail.
pub struct ScriptedExecutor {
    endpoints: Mutex<HashMap<String, Endpoint>>,
    gate: Semaphore,
    started: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(HashMap::new()),
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
        })
    }

    pub fn respond_after(&self, endpoint: &str, delay: Duration) {
        self.set(endpoint, Behaviour::Respond { delay });
    }

    /// Both calls and probes against `endpoint` fail.
    pub fn fail(&self, endpoint: &str) {
        self.set(endpoint, Behaviour::Fail);
    }

    /// Calls against `endpoint` block until [`ScriptedExecutor::release`].
    pub fn hold(&self, endpoint: &str) {
        self.set(endpoint, Behaviour::Hold);
    }

    pub fn release(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    /// Node calls started so far, across all endpoints.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn calls_to(&self, endpoint: &str) -> usize {
        self.endpoints
            .lock()
            .unwrap()
            .get(endpoint)
            .map(|endpoint| endpoint.calls)
            .unwrap_or(0)
    }

    fn set(&self, endpoint: &str, behaviour: Behaviour) {
        self.endpoints.lock().unwrap().insert(
            endpoint.to_string(),
            Endpoint {
                behaviour,
                calls: 0,
            },
        );
    }

    fn behaviour(&self, endpoint: &str) -> Behaviour {
        let mut endpoints = self.endpoints.lock().unwrap();
        let entry = endpoints.entry(endpoint.to_string()).or_insert(Endpoint {
            behaviour: Behaviour::Respond {
                delay: Duration::ZERO,
            },
            calls: 0,
        });
        entry.calls += 1;
        entry.behaviour.clone()
    }
}

impl CallExecutor for ScriptedExecutor {
    fn execute<'a>(&'a self, node: &'a NodeTarget, payload: &'a CallPayload) -> ExecuteFuture<'a> {
        let behaviour = self.behaviour(&node.endpoint);
        self.started.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let answer: Value = json!({ "endpoint": node.endpoint, "method": payload.method });
            match behaviour {
                Behaviour::Respond { delay } => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(answer)
                }
                Behaviour::Fail => Err(anyhow!("connection refused by {}", node.endpoint)),
                Behaviour::Hold => match self.gate.acquire().await {
                    Ok(_permit) => Ok(answer),
                    Err(err) => Err(anyhow!(err)),
                },
            }
        })
    }

    fn probe<'a>(&'a self, node: &'a NodeTarget) -> Option<ProbeFuture<'a>> {
        let failing = matches!(
            self.endpoints
                .lock()
                .unwrap()
                .get(&node.endpoint)
                .map(|endpoint| &endpoint.behaviour),
            Some(Behaviour::Fail)
        );
        Some(Box::pin(async move {
            if failing {
                Err(anyhow!("probe refused by {}", node.endpoint))
            } else {
                Ok(())
            }
        }))
    }
}
