//! Call dispatch: borrow an instance, run one JSON-RPC round trip under the
//! route timeout, release with usage counters updated.

use super::RuntimeState;
use crate::catalog::SpecKey;
use crate::error::CoreError;
use crate::scheduler::{InstanceChannel, RouteContext, StartCause};
use rmcp::model::{CallToolResult, GetPromptResult, JsonObject, ReadResourceResult};
use std::future::Future;
use std::sync::Arc;
use tracing::{warn, Instrument};

impl RuntimeState {
    pub async fn dispatch_tool_call(
        &self,
        route: &RouteContext,
        spec_key: SpecKey,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, CoreError> {
        let cause = StartCause::tool_call(&route.client, name);
        let name = name.to_string();
        self.with_instance(route, spec_key, cause, move |channel| async move {
            channel.call_tool(&name, arguments).await
        })
        .await
    }

    pub async fn dispatch_resource_read(
        &self,
        route: &RouteContext,
        spec_key: SpecKey,
        uri: &str,
    ) -> Result<ReadResourceResult, CoreError> {
        let cause = StartCause {
            reason: crate::scheduler::CauseReason::ResourceRead,
            client: Some(route.client.clone()),
            tool: None,
        };
        let uri = uri.to_string();
        self.with_instance(route, spec_key, cause, move |channel| async move {
            channel.read_resource(&uri).await
        })
        .await
    }

    pub async fn dispatch_prompt_get(
        &self,
        route: &RouteContext,
        spec_key: SpecKey,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<GetPromptResult, CoreError> {
        let cause = StartCause {
            reason: crate::scheduler::CauseReason::PromptGet,
            client: Some(route.client.clone()),
            tool: None,
        };
        let name = name.to_string();
        self.with_instance(route, spec_key, cause, move |channel| async move {
            channel.get_prompt(&name, arguments).await
        })
        .await
    }

    /// The shared acquire → invoke → release path. Both the wait for a ready
    /// instance and the round trip itself are bounded by the route timeout.
    async fn with_instance<T, F, Fut>(
        &self,
        route: &RouteContext,
        spec_key: SpecKey,
        cause: StartCause,
        op: F,
    ) -> Result<T, CoreError>
    where
        F: FnOnce(Arc<dyn InstanceChannel>) -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let timeout = self.route_timeout();
        let span = tracing::info_span!(
            "route",
            client = %route.client,
            routing_key = %route.routing_key,
            cause = ?cause.reason,
            tool = cause.tool.as_deref().unwrap_or(""),
        );

        async {
            let instance = match tokio::time::timeout(
                timeout,
                self.scheduler().acquire_ready(spec_key, &route.routing_key),
            )
            .await
            {
                Ok(Ok(instance)) => instance,
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(CoreError::RouteTimeout(timeout)),
            };

            let result = match tokio::time::timeout(timeout, op(Arc::clone(&instance.channel))).await
            {
                Ok(result) => result,
                Err(_) => Err(CoreError::RouteTimeout(timeout)),
            };

            instance.record_call();
            if let Err(err) = self.scheduler().release(Arc::clone(&instance)).await {
                warn!(spec_key = %spec_key, error = %err, "release failed");
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{catalog_state, spec, tool, FakeChannel, RecordingScheduler, SchedCall};
    use std::time::Duration;

    fn route() -> RouteContext {
        RouteContext {
            client: "ide".into(),
            routing_key: "".into(),
        }
    }

    #[tokio::test]
    async fn tool_call_round_trip_releases_the_instance() {
        let state = catalog_state(1, vec![spec("git", &["git"])]);
        let key = state.summary.server_spec_keys["git"];
        let scheduler = RecordingScheduler::new();
        scheduler.register_channel(
            key,
            "git",
            Arc::new(FakeChannel::with_tools(vec![tool("git_status")])),
        );
        let runtime = RuntimeState::new(state, Arc::clone(&scheduler));

        let result = runtime
            .dispatch_tool_call(&route(), key, "git_status", None)
            .await
            .unwrap();
        assert_ne!(result.is_error, Some(true));

        let calls = scheduler.calls.lock().clone();
        assert!(calls.contains(&SchedCall::Acquire { spec_key: key }));
        assert!(calls.contains(&SchedCall::Release { spec_key: key }));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_server_maps_to_route_timeout() {
        let mut state = catalog_state(1, vec![spec("git", &["git"])]);
        Arc::get_mut(&mut state)
            .unwrap()
            .summary
            .runtime
            .route_timeout_seconds = 1;
        let key = state.summary.server_spec_keys["git"];
        let scheduler = RecordingScheduler::new();
        scheduler.register_channel(
            key,
            "git",
            Arc::new(FakeChannel {
                delay: Some(Duration::from_secs(5)),
                ..Default::default()
            }),
        );
        let runtime = RuntimeState::new(state, Arc::clone(&scheduler));

        let err = runtime
            .dispatch_tool_call(&route(), key, "git_status", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::RouteTimeout(_)));

        // The borrowed instance is still released after the timeout.
        let calls = scheduler.calls.lock().clone();
        assert!(calls.contains(&SchedCall::Release { spec_key: key }));
    }

    #[tokio::test]
    async fn unavailable_pool_propagates() {
        let state = catalog_state(1, vec![spec("git", &["git"])]);
        let key = state.summary.server_spec_keys["git"];
        let runtime = RuntimeState::new(state, RecordingScheduler::new());

        let err = runtime
            .dispatch_tool_call(&route(), key, "git_status", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unavailable(_)));
    }
}
