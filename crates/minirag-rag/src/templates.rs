//! Prompt templates
//!
//! Templates are compiled into the binary and looked up by
//! `(language, group, key)`. A lookup in an unsupported language falls back
//! to the default language. `$name` placeholders are replaced from the
//! supplied variables; `$$` yields a literal `$`.

/// `(language, group, key, template)`
const TEMPLATES: &[(&str, &str, &str, &str)] = &[
    (
        "en",
        "rag",
        "system_prompt",
        "You are an assistant to generate a response for the user.\n\
         You will be provided by a set of documents associated with the user's query.\n\
         You have to generate a response based on the documents provided.\n\
         Ignore the documents that are not relevant to the user's query.\n\
         You can apologize to the user if you are not able to generate a response.\n\
         You have to generate response in the same language as the user's query.\n\
         Be polite and respectful to the user.\n\
         Be precise and concise in your response. Avoid unnecessary information.",
    ),
    (
        "en",
        "rag",
        "document_prompt",
        "## Document No: $doc_num\n\
         ### Content: $chunk_text",
    ),
    (
        "en",
        "rag",
        "footer_prompt",
        "Based only on the above documents, please generate an answer for the user.\n\
         ## Question:\n\
         $query\n\
         \n\
         ## Answer:",
    ),
    (
        "en",
        "rag",
        "stories_prompt",
        "You are an assistant to generate ClickUp stories from the provided document.\n\
         Focus on actionable tasks and technical details.\n\
         Generate concise and clear stories suitable for task creation.\n\
         If information is missing, politely note it.\n\
         Respond in the same language as the user's query.\n\
         Be precise, concise, and polite.",
    ),
    (
        "en",
        "rag",
        "story_footer_prompt",
        "Based only on the document below, generate technical stories for ClickUp.\n\
         ## Document:\n\
         $document_text\n\
         \n\
         ## Generated Stories:",
    ),
];

/// Language-aware lookup over the compiled template table
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    language: String,
    default_language: String,
}

impl TemplateRegistry {
    /// Use `language` when any template exists for it, else `default_language`
    pub fn new(language: impl Into<String>, default_language: impl Into<String>) -> Self {
        let default_language = default_language.into();
        let language = language.into();
        let language = if Self::supports(&language) {
            language
        } else {
            tracing::warn!(language = %language, fallback = %default_language, "Unsupported template language");
            default_language.clone()
        };

        Self {
            language,
            default_language,
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    fn supports(language: &str) -> bool {
        TEMPLATES.iter().any(|(lang, ..)| *lang == language)
    }

    fn lookup(language: &str, group: &str, key: &str) -> Option<&'static str> {
        TEMPLATES
            .iter()
            .find(|(l, g, k, _)| *l == language && *g == group && *k == key)
            .map(|(.., text)| *text)
    }

    /// Render template `group/key` with `vars`; `None` for unknown keys
    pub fn get(&self, group: &str, key: &str, vars: &[(&str, &str)]) -> Option<String> {
        if group.is_empty() || key.is_empty() {
            return None;
        }

        let template = Self::lookup(&self.language, group, key)
            .or_else(|| Self::lookup(&self.default_language, group, key))?;
        Some(substitute(template, vars))
    }
}

/// Replace `$name` placeholders; unknown names are left as written
fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(stripped) = after.strip_prefix('$') {
            out.push('$');
            rest = stripped;
            continue;
        }

        let name_len = after
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
            .map_or(after.len(), |(i, _)| i);
        let name = &after[..name_len];

        match vars.iter().find(|(k, _)| *k == name) {
            Some((_, value)) if !name.is_empty() => out.push_str(value),
            _ => {
                out.push('$');
                out.push_str(name);
            }
        }
        rest = &after[name_len..];
    }

    out.push_str(rest);
    out
}
