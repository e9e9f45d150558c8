//! `bulk_like_assets` — like (or unlike) every asset behind a filter
//! reference produced by `filter_assets`.

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use lum_domain::chat::ToolDescriptor;
use lum_domain::Error;

use crate::deps::{ToolContext, ToolDeps};
use crate::error::ToolError;
use crate::registry::{Tool, ToolFactory};
use crate::sidechannel::{ExecutionStatus, UiEvent};

pub const NAME: &str = "bulk_like_assets";

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: NAME.into(),
        description: "Mark every asset behind a filter reference as liked (or not liked). \
                      Takes the ref_id returned by filter_assets."
            .into(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "ref_id": { "type": "string", "description": "Reference id from filter_assets" },
                "liked": { "type": "boolean", "description": "true to like, false to unlike (default true)" }
            },
            "required": ["ref_id"]
        }),
        emits_ui_events: true,
        returns_directly: false,
    }
}

pub fn factory() -> ToolFactory {
    Box::new(|deps| {
        Arc::new(BulkLikeTool {
            descriptor: descriptor(),
            deps: deps.clone(),
        })
    })
}

#[derive(Deserialize)]
struct Args {
    ref_id: String,
    #[serde(default = "default_liked")]
    liked: bool,
}

fn default_liked() -> bool {
    true
}

#[derive(Deserialize)]
struct FilterRefPayload {
    asset_ids: Vec<Uuid>,
}

pub struct BulkLikeTool {
    descriptor: ToolDescriptor,
    deps: ToolDeps,
}

#[async_trait::async_trait]
impl Tool for BulkLikeTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let started = Instant::now();
        let args: Args = serde_json::from_value(args.clone())
            .map_err(|e| ToolError::Failed(format!("invalid arguments: {e}")))?;

        self.deps.dispatcher.dispatch(
            UiEvent::tool_execution(
                NAME,
                &ctx.execution_id,
                ExecutionStatus::Pending,
                if args.liked {
                    "Liking assets"
                } else {
                    "Unliking assets"
                },
            )
            .with_parameters(json!({"ref_id": args.ref_id, "liked": args.liked})),
        );
        self.deps.dispatcher.dispatch(UiEvent::tool_execution(
            NAME,
            &ctx.execution_id,
            ExecutionStatus::Running,
            "Updating assets",
        ));

        let payload: FilterRefPayload = match self
            .deps
            .refs
            .get_as(Some(ctx.run_id), &args.ref_id)
        {
            Ok(p) => p,
            Err(Error::NotFound(_)) => {
                self.deps.dispatcher.dispatch(
                    UiEvent::tool_execution(
                        NAME,
                        &ctx.execution_id,
                        ExecutionStatus::Error,
                        "Reference not found",
                    )
                    .with_error(format!("unknown or expired reference {}", args.ref_id)),
                );
                return Err(ToolError::Failed(format!(
                    "reference {} was not found or has expired; run filter_assets again to get \
                     a fresh reference",
                    args.ref_id
                )));
            }
            Err(e) => return Err(ToolError::Failed(e.to_string())),
        };

        let changed = self
            .deps
            .queries
            .set_liked(&payload.asset_ids, args.liked)
            .await
            .map_err(|e| ToolError::Failed(format!("bulk update failed: {e}")))?;

        let duration_ms = started.elapsed().as_millis() as u64;
        let verb = if args.liked { "liked" } else { "unliked" };
        self.deps.dispatcher.dispatch(
            UiEvent::tool_execution(
                NAME,
                &ctx.execution_id,
                ExecutionStatus::Success,
                format!("Marked {changed} assets as {verb}"),
            )
            .with_duration_ms(duration_ms),
        );

        Ok(json!({
            "message": format!(
                "Marked {changed} of {} assets as {verb}.",
                payload.asset_ids.len()
            ),
            "count": changed,
            "duration_ms": duration_ms,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::refs::ReferenceManager;
    use crate::sidechannel::side_channel;
    use lum_domain::asset::{AssetKind, AssetQueries, AssetSummary, MemoryAssetIndex};

    fn setup(n: usize) -> (BulkLikeTool, Arc<MemoryAssetIndex>, Arc<ReferenceManager>) {
        let index = Arc::new(MemoryAssetIndex::new());
        for i in 0..n {
            index.insert(AssetSummary {
                id: Uuid::new_v4(),
                repository_id: Uuid::new_v4(),
                storage_path: format!("{i}.jpg"),
                file_name: format!("{i}.jpg"),
                kind: AssetKind::Photo,
                rating: None,
                liked: false,
                taken_at: None,
                thumbnail_path: None,
            });
        }
        let (dispatcher, _rx) = side_channel();
        let refs = Arc::new(ReferenceManager::new(std::time::Duration::from_secs(60)));
        let deps = ToolDeps {
            queries: index.clone(),
            refs: refs.clone(),
            dispatcher,
        };
        (
            BulkLikeTool {
                descriptor: descriptor(),
                deps,
            },
            index,
            refs,
        )
    }

    async fn ids_of(index: &MemoryAssetIndex) -> Vec<Uuid> {
        index
            .search(&Default::default())
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect()
    }

    #[tokio::test]
    async fn likes_all_referenced_assets() {
        let (tool, index, refs) = setup(3);
        let run_id = Uuid::new_v4();
        let ids = ids_of(&index).await;
        let ref_id = refs.store_scoped(run_id, json!({"asset_ids": ids}), "hits");

        let ctx = ToolContext::new(run_id, "tc_1", CancelToken::new());
        let out = tool
            .invoke(&ctx, json!({"ref_id": ref_id}))
            .await
            .unwrap();
        assert_eq!(out["count"], 3);

        let liked = index
            .search(&lum_domain::asset::AssetFilter {
                liked: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(liked.len(), 3);
    }

    #[tokio::test]
    async fn unknown_reference_is_a_business_error() {
        let (tool, _index, _refs) = setup(1);
        let ctx = ToolContext::new(Uuid::new_v4(), "tc_1", CancelToken::new());
        let err = tool
            .invoke(&ctx, json!({"ref_id": "ref_gone"}))
            .await
            .unwrap_err();
        match err {
            ToolError::Failed(msg) => assert!(msg.contains("filter_assets")),
            other => panic!("expected business error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reference_from_another_run_is_invisible() {
        let (tool, index, refs) = setup(2);
        let ids = ids_of(&index).await;
        let ref_id = refs.store_scoped(Uuid::new_v4(), json!({"asset_ids": ids}), "foreign");

        let ctx = ToolContext::new(Uuid::new_v4(), "tc_1", CancelToken::new());
        let err = tool.invoke(&ctx, json!({"ref_id": ref_id})).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed(_)));
    }

    #[tokio::test]
    async fn unlike_flips_the_flag_back() {
        let (tool, index, refs) = setup(2);
        let run_id = Uuid::new_v4();
        let ids = ids_of(&index).await;
        index.set_liked(&ids, true).await.unwrap();
        let ref_id = refs.store_scoped(run_id, json!({"asset_ids": ids}), "hits");

        let ctx = ToolContext::new(run_id, "tc_1", CancelToken::new());
        let out = tool
            .invoke(&ctx, json!({"ref_id": ref_id, "liked": false}))
            .await
            .unwrap();
        assert_eq!(out["count"], 2);
        assert!(out["message"].as_str().unwrap().contains("unliked"));
    }

    #[tokio::test]
    async fn missing_ref_id_argument_fails_fast() {
        let (tool, _index, _refs) = setup(1);
        let ctx = ToolContext::new(Uuid::new_v4(), "tc_1", CancelToken::new());
        let err = tool.invoke(&ctx, json!({"liked": true})).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed(_)));
    }
}
