//! Driving a flow through the hooks.
//!
//! Both HTTP engines go through [`fire`] so a flow gets the same treatment
//! regardless of protocol: after every hook a killed flow stops the exchange,
//! and an intercepted flow holds it up until it is resumed.

use crate::{
    flow::{
        Flow,
        FlowError,
        FlowState,
        Killed,
    },
    hooks::Hooks,
    http::Error,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum HttpHook {
    RequestHeaders,
    Request,
    ResponseHeaders,
    Response,
    Error,
}

impl HttpHook {
    /// State the flow continues in after being resumed.
    fn resume_state(self, flow: &Flow) -> FlowState {
        match self {
            Self::RequestHeaders | Self::Request => FlowState::Started,
            Self::ResponseHeaders | Self::Response => FlowState::ResponseReceived,
            Self::Error => {
                if flow.response().is_some() {
                    FlowState::ResponseReceived
                }
                else {
                    FlowState::Accepted
                }
            }
        }
    }
}

/// Calls `hook` and waits for the flow if the hook intercepted it.
pub async fn fire(hooks: &dyn Hooks, flow: &mut Flow, hook: HttpHook) -> Result<(), Killed> {
    if flow.is_killed() {
        return Err(Killed);
    }

    tracing::trace!(flow = %flow.id, %hook, "calling hook");
    match hook {
        HttpHook::RequestHeaders => hooks.request_headers(flow).await,
        HttpHook::Request => hooks.request(flow).await,
        HttpHook::ResponseHeaders => hooks.response_headers(flow).await,
        HttpHook::Response => hooks.response(flow).await,
        HttpHook::Error => hooks.error(flow).await,
    }

    if flow.is_killed() {
        return Err(Killed);
    }
    let state = hook.resume_state(flow);
    flow.wait_for_decision(state).await
}

/// Records `error` on the flow and calls the error hook. The flow may already
/// have an error if the hooks set one, which is kept.
pub async fn fail(hooks: &dyn Hooks, flow: &mut Flow, error: &Error) {
    let _ = flow.set_error(FlowError::new(error.to_string()));
    if !flow.is_killed() {
        // a kill from the error hook has nothing left to stop
        let _ = fire(hooks, flow, HttpHook::Error).await;
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::{
        fire,
        HttpHook,
    };
    use crate::{
        connection::ClientConnection,
        flow::{
            Flow,
            FlowState,
        },
        hooks::Hooks,
        http::message::Request,
    };

    struct Interceptor;

    #[async_trait]
    impl Hooks for Interceptor {
        async fn request(&self, flow: &mut Flow) {
            let handle = flow.intercept();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                handle.resume();
            });
        }

        async fn response(&self, flow: &mut Flow) {
            flow.kill();
        }
    }

    fn flow() -> Flow {
        Flow::new(
            ClientConnection::detached(),
            Request::get("http://example.com/").unwrap(),
        )
    }

    #[tokio::test]
    async fn it_waits_for_intercepted_flows() {
        let mut flow = flow();
        fire(&Interceptor, &mut flow, HttpHook::Request).await.unwrap();
        assert_eq!(flow.state(), FlowState::Started);
    }

    #[tokio::test]
    async fn it_stops_killed_flows() {
        let mut flow = flow();
        assert!(fire(&Interceptor, &mut flow, HttpHook::Response).await.is_err());
        assert!(fire(&Interceptor, &mut flow, HttpHook::Request).await.is_err());
        assert_eq!(flow.state(), FlowState::Killed);
    }
}
