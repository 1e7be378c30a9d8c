//! The gadget trait pair: typed interface plus dynamic dispatch wrapper.

use async_trait::async_trait;
use futures::Future;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::context::GadgetContext;
use super::errors::GadgetError;
use crate::store::MediaItem;

/// What a gadget hands back to the loop.
#[derive(Debug, Clone, Default)]
pub struct GadgetOutput {
    /// Result text surfaced to the model.
    pub result: String,
    /// Media produced alongside the text.
    pub media: Vec<MediaItem>,
    /// Direct cost in USD, added to anything reported through
    /// [`GadgetContext::report_cost`].
    pub cost: Option<f64>,
    /// Ask the loop to terminate after this iteration.
    pub breaks_loop: bool,
}

impl GadgetOutput {
    /// A plain text result.
    #[must_use]
    pub fn text(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            ..Self::default()
        }
    }

    /// Attach a direct cost.
    #[must_use]
    pub fn with_cost(mut self, usd: f64) -> Self {
        self.cost = Some(usd);
        self
    }

    /// Attach a media item.
    #[must_use]
    pub fn with_media(mut self, item: MediaItem) -> Self {
        self.media.push(item);
        self
    }

    /// Mark the output as a loop terminator.
    #[must_use]
    pub fn breaking(mut self) -> Self {
        self.breaks_loop = true;
        self
    }
}

impl From<String> for GadgetOutput {
    fn from(result: String) -> Self {
        Self::text(result)
    }
}

impl From<&str> for GadgetOutput {
    fn from(result: &str) -> Self {
        Self::text(result)
    }
}

/// A typed gadget.
///
/// `Args` derives its JSON schema through `schemars`; the registry validates
/// parsed params against it before the gadget runs, so `invoke` never sees
/// malformed input.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(serde::Deserialize, schemars::JsonSchema)]
/// struct Args { index: u32, status: String }
///
/// struct SetTodoStatus;
///
/// impl Gadget for SetTodoStatus {
///     const NAME: &'static str = "SetTodoStatus";
///     type Args = Args;
///     type Error = GadgetError;
///
///     fn description(&self) -> String {
///         "Update a todo item's status".into()
///     }
///
///     async fn invoke(&self, args: Args, _ctx: &GadgetContext) -> Result<GadgetOutput, GadgetError> {
///         Ok(GadgetOutput::text(format!("todo {} -> {}", args.index, args.status)))
///     }
/// }
/// ```
pub trait Gadget: Send + Sync + Sized + 'static {
    /// The gadget's unique name, as invoked in start markers.
    const NAME: &'static str;

    /// The parameter type.
    type Args: DeserializeOwned + JsonSchema + Send;
    /// The error type. Use [`GadgetError`] directly to raise signalling
    /// kinds (human input, task completion).
    type Error: std::error::Error + Send + Sync + 'static;

    /// One-line description for the system prompt.
    fn description(&self) -> String {
        String::new()
    }

    /// Per-gadget timeout override in milliseconds.
    fn timeout_ms(&self) -> Option<u64> {
        None
    }

    /// Execute the gadget.
    fn invoke(
        &self,
        args: Self::Args,
        ctx: &GadgetContext,
    ) -> impl Future<Output = Result<GadgetOutput, Self::Error>> + Send;
}

/// Dynamic dispatch wrapper over [`Gadget`], stored by the registry.
#[async_trait]
pub trait GadgetDyn: Send + Sync {
    /// The gadget name.
    fn name(&self) -> String;

    /// The gadget description.
    fn description(&self) -> String;

    /// The parameter JSON schema.
    fn parameters_schema(&self) -> Value;

    /// Per-gadget timeout override.
    fn timeout_ms(&self) -> Option<u64>;

    /// Execute with already-validated params.
    async fn invoke(&self, params: Value, ctx: GadgetContext) -> Result<GadgetOutput, GadgetError>;
}

#[async_trait]
impl<G: Gadget> GadgetDyn for G {
    fn name(&self) -> String {
        G::NAME.to_string()
    }

    fn description(&self) -> String {
        Gadget::description(self)
    }

    fn parameters_schema(&self) -> Value {
        schemars::SchemaGenerator::default()
            .into_root_schema_for::<G::Args>()
            .to_value()
    }

    fn timeout_ms(&self) -> Option<u64> {
        Gadget::timeout_ms(self)
    }

    async fn invoke(&self, params: Value, ctx: GadgetContext) -> Result<GadgetOutput, GadgetError> {
        let args: G::Args = serde_json::from_value(params)
            .map_err(|err| GadgetError::Validation(err.to_string()))?;
        Gadget::invoke(self, args, &ctx)
            .await
            .map_err(GadgetError::from_gadget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, JsonSchema)]
    struct EchoArgs {
        text: String,
    }

    struct Echo;

    impl Gadget for Echo {
        const NAME: &'static str = "Echo";
        type Args = EchoArgs;
        type Error = GadgetError;

        async fn invoke(
            &self,
            args: EchoArgs,
            _ctx: &GadgetContext,
        ) -> Result<GadgetOutput, GadgetError> {
            Ok(GadgetOutput::text(args.text))
        }
    }

    #[test]
    fn schema_exposes_typed_fields() {
        let gadget: &dyn GadgetDyn = &Echo;
        let schema = gadget.parameters_schema();
        assert_eq!(schema["properties"]["text"]["type"], "string");
        assert_eq!(gadget.name(), "Echo");
    }

    #[tokio::test]
    async fn dyn_invoke_deserializes_and_runs() {
        let gadget: &dyn GadgetDyn = &Echo;
        let ctx = GadgetContext::for_tests("t1");
        let output = gadget
            .invoke(serde_json::json!({ "text": "hi" }), ctx)
            .await
            .unwrap();
        assert_eq!(output.result, "hi");
    }

    #[tokio::test]
    async fn dyn_invoke_reports_bad_args_as_validation() {
        let gadget: &dyn GadgetDyn = &Echo;
        let ctx = GadgetContext::for_tests("t2");
        let err = gadget
            .invoke(serde_json::json!({ "text": 5 }), ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, GadgetError::Validation(_)));
    }
}
