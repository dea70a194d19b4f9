//! Generator registry: dispatch a request to the generator registered for
//! its (resource kind, target format) pair.
//!
//! Generators render source text only. `generate` checks the retrieved
//! context, prefixes the context header, and wraps the result into an
//! artifact, so every generator gets the same treatment.

pub mod ansible;
pub mod docker;
pub mod kubernetes;
pub mod terraform;

use crate::core::config::GenerationSettings;
use crate::core::error::{GenerationError, PipelineError, UnsupportedTargetError};
use crate::core::types::{
    GeneratedArtifact, InfrastructureRequest, ResourceKind, RetrievedContext, TargetFormat,
};
use std::collections::HashMap;
use std::sync::Arc;

/// One IaC generator family.
pub trait Generator: Send + Sync {
    fn name(&self) -> &'static str;

    fn format(&self) -> TargetFormat;

    /// Resource kinds this generator can render.
    fn kinds(&self) -> &'static [ResourceKind];

    /// Render the artifact body. Must be deterministic in its inputs.
    fn render(
        &self,
        request: &InfrastructureRequest,
        context: &RetrievedContext,
    ) -> Result<String, GenerationError>;
}

/// Comment header naming the reference documents that informed the artifact.
pub fn context_header(generator: &str, format: TargetFormat, context: &RetrievedContext) -> String {
    let c = format.comment_prefix();
    let mut lines = vec![format!("{} Generated by autodevops ({})", c, generator)];
    if context.is_empty() {
        lines.push(format!("{} Reference context: none", c));
    } else {
        lines.push(format!("{} Reference context:", c));
        for doc in &context.documents {
            lines.push(format!("{}   - {} (score {:.2})", c, doc.id, doc.score));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Run one generator and wrap its output into an artifact.
pub fn generate(
    generator: &dyn Generator,
    request: &InfrastructureRequest,
    context: &RetrievedContext,
) -> Result<GeneratedArtifact, GenerationError> {
    if request.format() != generator.format() {
        return Err(GenerationError::new(format!(
            "{} renders {}, request targets {}",
            generator.name(),
            generator.format(),
            request.format()
        )));
    }
    if !generator.kinds().contains(&request.kind()) {
        return Err(GenerationError::new(format!(
            "{} cannot render {} resources",
            generator.name(),
            request.kind()
        )));
    }
    context
        .check()
        .map_err(|e| GenerationError::new(format!("malformed retrieved context: {}", e)))?;

    let body = generator.render(request, context)?;
    if body.trim().is_empty() {
        return Err(GenerationError::new(format!(
            "{} produced an empty artifact",
            generator.name()
        )));
    }
    let content = format!(
        "{}{}",
        context_header(generator.name(), generator.format(), context),
        body
    );
    Ok(GeneratedArtifact::new(request, generator.name(), content))
}

/// Maps (kind, format) to a generator.
#[derive(Default)]
pub struct GeneratorRegistry {
    entries: HashMap<(ResourceKind, TargetFormat), Arc<dyn Generator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the Terraform, Kubernetes, and Ansible generators.
    pub fn with_builtin(settings: &GenerationSettings) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(terraform::TerraformGenerator::new(settings.clone())));
        registry.register(Arc::new(kubernetes::KubernetesGenerator::new(settings.clone())));
        registry.register(Arc::new(ansible::AnsibleGenerator::new(settings.clone())));
        registry.register(Arc::new(docker::DockerGenerator::new(settings.clone())));
        registry
    }

    /// Register a generator for every kind it declares, replacing earlier entries.
    pub fn register(&mut self, generator: Arc<dyn Generator>) {
        for kind in generator.kinds() {
            self.entries
                .insert((*kind, generator.format()), Arc::clone(&generator));
        }
    }

    pub fn lookup(
        &self,
        kind: ResourceKind,
        format: TargetFormat,
    ) -> Result<Arc<dyn Generator>, UnsupportedTargetError> {
        self.entries
            .get(&(kind, format))
            .cloned()
            .ok_or(UnsupportedTargetError { kind, format })
    }

    /// Look up and run the generator for `request`.
    pub fn generate(
        &self,
        request: &InfrastructureRequest,
        context: &RetrievedContext,
    ) -> Result<GeneratedArtifact, PipelineError> {
        let generator = self.lookup(request.kind(), request.format())?;
        Ok(generate(generator.as_ref(), request, context)?)
    }

    /// Supported (kind, format) pairs, sorted.
    pub fn supported(&self) -> Vec<(ResourceKind, TargetFormat)> {
        let mut pairs: Vec<_> = self.entries.keys().copied().collect();
        pairs.sort();
        pairs
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::core::resolver;
    use crate::core::types::{ConversationContext, InfrastructureRequest, RawIntent};

    /// Resolve a JSON object of fields into a request.
    pub fn request(fields: serde_json::Value) -> InfrastructureRequest {
        let mut raw = RawIntent::new();
        if let serde_json::Value::Object(map) = fields {
            for (k, v) in map {
                raw = raw.with(&k, v);
            }
        }
        resolver::resolve(&raw, &ConversationContext::default()).unwrap()
    }
}
