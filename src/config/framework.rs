//! Copywriting frameworks: a static registry of prompt templates and the
//! deterministic fallback copy used when generation is unavailable.

use log::warn;

use crate::models::profile::ProfileContext;

pub const DEFAULT_FRAMEWORK_ID: &str = "aida";
const CONTEXT_PLACEHOLDER: &str = "{{businessContext}}";
const PROMPT_PLACEHOLDER: &str = "{prompt}";

#[derive(Debug, PartialEq, Eq)]
pub struct Section {
    pub heading: &'static str,
    pub fallback: &'static str,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Framework {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub sections: &'static [Section],
    pub template: &'static str,
}

impl Framework {
    pub fn display_name(&self) -> String {
        format!("{} ({})", self.name, self.description)
    }

    pub fn headings(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.sections.iter().map(|s| s.heading)
    }
}

static FRAMEWORKS: [Framework; 3] = [
    Framework {
        id: "aida",
        name: "AIDA",
        description: "Attention, Interest, Desire, Action",
        sections: &[
            Section {
                heading: "Attention",
                fallback: "This is a mock response for \"{prompt}\" because the API call failed.",
            },
            Section {
                heading: "Interest",
                fallback: "In production, this section would contain compelling AI-generated content that builds interest in your product or service.",
            },
            Section {
                heading: "Desire",
                fallback: "The mock system keeps the application working even when the generation service is unavailable.",
            },
            Section {
                heading: "Action",
                fallback: "Before deploying, make sure the generation API key is configured in the environment.",
            },
        ],
        template: "You are a copywriting assistant that specializes in the AIDA (Attention, Interest, Desire, Action) framework.\n{{businessContext}}\n\nWhen responding to user queries, structure your copy in clear sections with headings for Attention, Interest, Desire, and Action, unless the user asks for a different format.",
    },
    Framework {
        id: "fab",
        name: "FAB",
        description: "Features, Advantages, Benefits",
        sections: &[
            Section {
                heading: "Features",
                fallback: "- This is a mock response for \"{prompt}\"\n- The API call failed, so this is fallback content\n- In production this would be AI-generated content",
            },
            Section {
                heading: "Advantages",
                fallback: "- Users still get a response when the API fails\n- The client can be exercised without making API calls",
            },
            Section {
                heading: "Benefits",
                fallback: "- Graceful degradation during outages\n- A clear indication that fallback mode is active",
            },
        ],
        template: "You are a copywriting assistant that specializes in the FAB (Features, Advantages, Benefits) framework.\n{{businessContext}}\n\nWhen responding to user queries, structure your copy in clear sections with headings for Features, Advantages, and Benefits, unless the user asks for a different format.",
    },
    Framework {
        id: "pas",
        name: "PAS",
        description: "Problem, Agitate, Solution",
        sections: &[
            Section {
                heading: "Problem",
                fallback: "This is a mock response for \"{prompt}\" because the API call failed.",
            },
            Section {
                heading: "Agitate",
                fallback: "When the generation service is down, users who need marketing copy quickly are left waiting.",
            },
            Section {
                heading: "Solution",
                fallback: "The fallback keeps the structure of the copy visible until the service is available again.",
            },
        ],
        template: "You are a copywriting assistant that specializes in the PAS (Problem, Agitate, Solution) framework.\n{{businessContext}}\n\nWhen responding to user queries, structure your copy in clear sections with headings for Problem, Agitate, and Solution, unless the user asks for a different format.",
    },
];

pub fn all() -> &'static [Framework] {
    &FRAMEWORKS
}

/// Case-insensitive lookup by id.
pub fn resolve(id: &str) -> Option<&'static Framework> {
    let id = id.trim();
    FRAMEWORKS.iter().find(|f| f.id.eq_ignore_ascii_case(id))
}

fn default_framework() -> &'static Framework {
    &FRAMEWORKS[0]
}

/// Lookup by name, by the short name before ` (`, or by the full display name.
pub fn by_name(name: &str) -> Option<&'static Framework> {
    let short_name = name.split(" (").next().unwrap_or(name);
    FRAMEWORKS.iter().find(|f| {
        f.name.eq_ignore_ascii_case(name) ||
            f.name.eq_ignore_ascii_case(short_name) ||
            f.display_name().eq_ignore_ascii_case(name)
    })
}

/// Maps older free-text framework labels to a registry id.
///
/// Unmatched input falls back to [`DEFAULT_FRAMEWORK_ID`]; the result is
/// always a registered id, so converting twice changes nothing.
pub fn legacy_convert(value: &str) -> &'static str {
    if value.trim().is_empty() {
        return DEFAULT_FRAMEWORK_ID;
    }
    if let Some(f) = resolve(value) {
        return f.id;
    }

    let lowered = value.to_lowercase();
    for f in FRAMEWORKS.iter() {
        if lowered.contains(f.id) {
            return f.id;
        }
    }
    if let Some(f) = by_name(value) {
        return f.id;
    }

    warn!("Could not convert framework value '{}', defaulting to {}", value, DEFAULT_FRAMEWORK_ID);
    DEFAULT_FRAMEWORK_ID
}

pub fn display_name(id: &str) -> String {
    if id.trim().is_empty() {
        return "Unknown Framework".to_string();
    }
    match resolve(id) {
        Some(f) => f.display_name(),
        None => resolve(legacy_convert(id)).unwrap_or(default_framework()).display_name(),
    }
}

pub fn render(framework: &Framework, profile: Option<&ProfileContext>) -> String {
    let context = match profile {
        Some(p) => format!("\nBusiness Context:\n{}", p.lines().join("\n")),
        None => String::new(),
    };
    framework.template.replacen(CONTEXT_PLACEHOLDER, &context, 1)
}

/// System prompt for a framework id; unknown ids use the default framework.
pub fn system_prompt(framework_id: &str, profile: Option<&ProfileContext>) -> String {
    let framework = resolve(framework_id).unwrap_or_else(|| {
        warn!("Framework id '{}' not found, defaulting to {}", framework_id, DEFAULT_FRAMEWORK_ID);
        default_framework()
    });
    render(framework, profile)
}

/// Deterministic copy built from the framework's section headings.
pub fn mock_response(framework_id: &str, prompt: &str) -> String {
    let framework = resolve(framework_id).unwrap_or_else(default_framework);
    let mut out = String::new();
    for section in framework.sections {
        out.push_str("# ");
        out.push_str(section.heading);
        out.push('\n');
        out.push_str(&section.fallback.replace(PROMPT_PLACEHOLDER, prompt));
        out.push_str("\n\n");
    }
    out.truncate(out.trim_end().len());
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ProfileContext {
        ProfileContext {
            name: "Aqua Co".into(),
            industry: Some("Outdoor gear".into()),
            brand_voice: Some("Playful".into()),
            ..Default::default()
        }
    }

    #[test]
    fn resolve_ignores_case() {
        assert_eq!(resolve("AIDA").map(|f| f.id), Some("aida"));
        assert_eq!(resolve("Pas").map(|f| f.id), Some("pas"));
        assert!(resolve("bab").is_none());
    }

    #[test]
    fn every_template_has_one_placeholder() {
        for f in all() {
            assert_eq!(f.template.matches(CONTEXT_PLACEHOLDER).count(), 1, "{}", f.id);
            assert!(!f.sections.is_empty());
        }
    }

    #[test]
    fn render_without_profile_drops_placeholder() {
        let rendered = render(resolve("fab").unwrap(), None);
        assert!(!rendered.contains(CONTEXT_PLACEHOLDER));
        assert!(!rendered.contains("Business Context"));
        assert!(rendered.starts_with("You are a copywriting assistant"));
    }

    #[test]
    fn render_with_profile_lists_present_fields_only() {
        let rendered = render(resolve("aida").unwrap(), Some(&profile()));
        assert!(
            rendered.contains(
                "\nBusiness Context:\nBusiness Name: Aqua Co\nIndustry: Outdoor gear\nBrand Voice: Playful\n"
            )
        );
        assert!(!rendered.contains("Target Audience"));
        assert!(!rendered.contains("Pain Points"));
    }

    #[test]
    fn system_prompt_defaults_unknown_ids() {
        assert_eq!(system_prompt("nope", None), render(resolve("aida").unwrap(), None));
    }

    #[test]
    fn legacy_labels_convert_to_ids() {
        assert_eq!(legacy_convert("AIDA (Attention, Interest, Desire, Action)"), "aida");
        assert_eq!(legacy_convert("PAS (Problem, Agitate, Solution)"), "pas");
        assert_eq!(legacy_convert("FAB (Features, Advantages, Benefits)"), "fab");
        assert_eq!(legacy_convert("FAB"), "fab");
        assert_eq!(legacy_convert(""), "aida");
        assert_eq!(legacy_convert("BAB (Before, After, Bridge)"), "aida");
        assert_eq!(legacy_convert("The 4 Ps (Promise, Picture, Proof, Push)"), "aida");
    }

    #[test]
    fn legacy_convert_is_idempotent() {
        let inputs = [
            "",
            "aida",
            "AIDA",
            "pas",
            "compass",
            "Fabulous",
            "BAB (Before, After, Bridge)",
            "ACCA (Awareness, Comprehension, Conviction, Action)",
            "   ",
            "random words",
            "ünïcödé",
        ];
        for input in inputs {
            let once = legacy_convert(input);
            assert_eq!(legacy_convert(once), once, "input {:?}", input);
            assert!(resolve(once).is_some());
        }
    }

    #[test]
    fn display_names() {
        assert_eq!(display_name("pas"), "PAS (Problem, Agitate, Solution)");
        assert_eq!(
            display_name("PAS (Problem, Agitate, Solution)"),
            "PAS (Problem, Agitate, Solution)"
        );
        assert_eq!(display_name(""), "Unknown Framework");
        assert_eq!(display_name("mystery"), "AIDA (Attention, Interest, Desire, Action)");
    }

    #[test]
    fn by_name_matches_short_and_full_names() {
        assert_eq!(by_name("fab").map(|f| f.id), Some("fab"));
        assert_eq!(by_name("AIDA (anything)").map(|f| f.id), Some("aida"));
        assert!(by_name("BAB").is_none());
    }

    #[test]
    fn mock_response_uses_section_headings() {
        let text = mock_response("aida", "Write about eco-friendly water bottles");
        for heading in ["# Attention", "# Interest", "# Desire", "# Action"] {
            assert!(text.contains(heading), "missing {}", heading);
        }
        assert!(text.contains("\"Write about eco-friendly water bottles\""));
        assert_eq!(text, mock_response("aida", "Write about eco-friendly water bottles"));
    }

    #[test]
    fn mock_response_for_unknown_framework_is_aida() {
        assert_eq!(mock_response("bab", "x"), mock_response("aida", "x"));
        let pas = mock_response("PAS", "x");
        assert!(pas.starts_with("# Problem\n"));
        assert!(pas.contains("# Agitate") && pas.contains("# Solution"));
    }
}
