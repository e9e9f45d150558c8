//! `filter_assets` — query the asset library, with user confirmation
//! before loading multi-asset results.
//!
//! First invocation counts the matches; above the confirmation
//! threshold it interrupts with `{count, message}` and saves the count.
//! On a targeted resume with `{approved: true}` it loads the assets,
//! stores an asset-id reference for downstream tools, and pushes the
//! DTOs to the UI side channel as a justified gallery.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use uuid::Uuid;

use lum_domain::asset::AssetFilter;
use lum_domain::chat::ToolDescriptor;

use crate::deps::{ToolContext, ToolDeps};
use crate::error::{stateful_interrupt, ToolError};
use crate::registry::{Tool, ToolFactory};
use crate::sidechannel::{components, DataEnvelope, ExecutionStatus, Rendering, UiEvent};

/// Cap applied when the model does not pass an explicit limit.
const DEFAULT_RESULT_LIMIT: usize = 100;

pub const NAME: &str = "filter_assets";

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: NAME.into(),
        description: "Filter the photo library by type, rating, liked state, filename, or \
                      date range. Returns a summary and a reference to the matched assets \
                      for follow-up tools."
            .into(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "type": { "type": "string", "enum": ["PHOTO", "VIDEO", "AUDIO"], "description": "Media type" },
                "rating": { "type": "integer", "minimum": 0, "maximum": 5, "description": "Exact star rating" },
                "liked": { "type": "boolean", "description": "Only liked (or only not-liked) assets" },
                "filename_contains": { "type": "string", "description": "Substring of the file name" },
                "taken_after": { "type": "string", "format": "date-time" },
                "taken_before": { "type": "string", "format": "date-time" },
                "limit": { "type": "integer", "minimum": 1, "description": "Maximum assets to load" }
            }
        }),
        emits_ui_events: true,
        returns_directly: false,
    }
}

pub fn factory(confirmation_threshold: u64) -> ToolFactory {
    Box::new(move |deps| {
        Arc::new(FilterAssetsTool {
            descriptor: descriptor(),
            deps: deps.clone(),
            confirmation_threshold,
        })
    })
}

pub struct FilterAssetsTool {
    descriptor: ToolDescriptor,
    deps: ToolDeps,
    confirmation_threshold: u64,
}

impl FilterAssetsTool {
    fn confirm_info(count: u64) -> Value {
        json!({
            "count": count,
            "message": format!("Found {count} assets matching the filter. Confirm to continue."),
        })
    }

    async fn load_and_respond(
        &self,
        ctx: &ToolContext,
        filter: &AssetFilter,
        started: Instant,
    ) -> Result<Value, ToolError> {
        let mut limited = filter.clone();
        if limited.limit.is_none() {
            limited.limit = Some(DEFAULT_RESULT_LIMIT);
        }
        let assets = self
            .deps
            .queries
            .search(&limited)
            .await
            .map_err(|e| ToolError::Failed(format!("asset query failed: {e}")))?;

        let count = assets.len();
        let ids: Vec<Uuid> = assets.iter().map(|a| a.id).collect();
        let ref_id = self.deps.refs.store_scoped(
            ctx.run_id,
            json!({"asset_ids": ids, "filter": filter}),
            "assets matched by filter_assets",
        );
        let duration_ms = started.elapsed().as_millis() as u64;

        self.deps.dispatcher.dispatch(
            UiEvent::tool_execution(
                NAME,
                &ctx.execution_id,
                ExecutionStatus::Success,
                format!("Found {count} assets"),
            )
            .with_duration_ms(duration_ms)
            .with_data(DataEnvelope {
                ref_id: Some(ref_id.clone()),
                payload_type: "asset_list".into(),
                payload: serde_json::to_value(&assets).unwrap_or(Value::Null),
                rendering: Some(Rendering {
                    component: components::JUSTIFIED_GALLERY.into(),
                    options: None,
                }),
            }),
        );

        Ok(json!({
            "message": format!("Found {count} assets matching the filter."),
            "ref_id": ref_id,
            "count": count,
            "duration_ms": duration_ms,
        }))
    }
}

#[async_trait::async_trait]
impl Tool for FilterAssetsTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let started = Instant::now();
        let filter: AssetFilter = serde_json::from_value(args.clone())
            .map_err(|e| ToolError::Failed(format!("invalid filter arguments: {e}")))?;

        // One pending event per tool call; a resume re-invocation only
        // continues the chain.
        if !ctx.was_interrupted() {
            self.deps.dispatcher.dispatch(
                UiEvent::tool_execution(
                    NAME,
                    &ctx.execution_id,
                    ExecutionStatus::Pending,
                    "Filtering assets",
                )
                .with_parameters(args.clone()),
            );
        }
        self.deps.dispatcher.dispatch(UiEvent::tool_execution(
            NAME,
            &ctx.execution_id,
            ExecutionStatus::Running,
            "Querying the asset index",
        ));

        if ctx.was_interrupted() {
            if !ctx.is_resume_target() {
                // Someone else was targeted; keep this leaf suspended
                // with the state it saved the first time.
                let state = ctx.saved_state().cloned().unwrap_or_else(|| json!({}));
                let count = state.get("count").and_then(Value::as_u64).unwrap_or(0);
                return Err(stateful_interrupt(Self::confirm_info(count), state));
            }

            let approved = ctx
                .user_data()
                .and_then(|v| v.get("approved"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !approved {
                self.deps.dispatcher.dispatch(UiEvent::tool_execution(
                    NAME,
                    &ctx.execution_id,
                    ExecutionStatus::Cancelled,
                    "Filter declined by the user",
                ));
                return Ok(json!({
                    "message": "The user declined to load the filtered assets.",
                }));
            }
            return self.load_and_respond(ctx, &filter, started).await;
        }

        let count = self
            .deps
            .queries
            .count(&filter)
            .await
            .map_err(|e| ToolError::Failed(format!("asset query failed: {e}")))?;

        if count == 0 {
            self.deps.dispatcher.dispatch(
                UiEvent::tool_execution(
                    NAME,
                    &ctx.execution_id,
                    ExecutionStatus::Success,
                    "No assets matched",
                )
                .with_duration_ms(started.elapsed().as_millis() as u64),
            );
            return Ok(json!({"message": "No assets match the filter.", "count": 0}));
        }

        if count > self.confirmation_threshold {
            return Err(stateful_interrupt(
                Self::confirm_info(count),
                json!({"count": count}),
            ));
        }

        self.load_and_respond(ctx, &filter, started).await
    }
}
