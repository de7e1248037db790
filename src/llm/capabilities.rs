// src/llm/capabilities.rs
// Per-model input capability table consumed by the context assembler

use crate::db::types::ResourceKind;

/// What kinds of binary input a model accepts inline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelCapabilities {
    pub vision: bool,
    pub pdf_input: bool,
    pub file_input: bool,
}

impl ModelCapabilities {
    /// Whether a resource of this kind may be attached directly (base64).
    pub fn permits(&self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Image => self.vision,
            ResourceKind::Pdf => self.pdf_input,
            ResourceKind::Markdown | ResourceKind::Attachment => self.file_input,
            // Abstract references never attach as bytes
            ResourceKind::Url | ResourceKind::Tag | ResourceKind::Folder | ResourceKind::Other => {
                false
            }
        }
    }
}

/// Look up capabilities by model id. Unknown models get the conservative
/// default (text only) so the assembler degrades their attachments to
/// summaries instead of sending bytes the provider will reject.
pub fn capabilities_for(model: &str) -> ModelCapabilities {
    let m = model.to_lowercase();

    // Frontier multimodal families: vision + pdf + generic files
    if m.starts_with("gpt-4o")
        || m.starts_with("gpt-4.1")
        || m.starts_with("gpt-5")
        || m.starts_with("o3")
        || m.starts_with("claude-3")
        || m.starts_with("claude-sonnet")
        || m.starts_with("claude-opus")
        || m.starts_with("claude-haiku")
        || m.starts_with("gemini-1.5")
        || m.starts_with("gemini-2")
        || m.starts_with("gemini-3")
    {
        return ModelCapabilities {
            vision: true,
            pdf_input: true,
            file_input: true,
        };
    }

    // Vision-only open models
    if m.contains("llava") || m.contains("vision") || m.contains("pixtral") {
        return ModelCapabilities {
            vision: true,
            pdf_input: false,
            file_input: true,
        };
    }

    // Text models that still accept plain file parts
    if m.starts_with("deepseek") || m.starts_with("qwen") || m.starts_with("llama") {
        return ModelCapabilities {
            vision: false,
            pdf_input: false,
            file_input: true,
        };
    }

    ModelCapabilities::default()
}

/// Media type for a resource's inline encoding, by extension.
pub fn media_type_for(source: &str) -> &'static str {
    let ext = source.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "md" | "markdown" => "text/markdown",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}
