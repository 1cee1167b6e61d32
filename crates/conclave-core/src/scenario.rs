//! Built-in scenario role templates.
//!
//! A scenario decorates each member's prompt with shared system
//! instructions plus an assigned role. Unknown scenario names are not an
//! error: the job simply dispatches the bare prompt.

/// One assignable role within a scenario.
#[derive(Debug, Clone)]
pub struct Role {
    pub title: &'static str,
    pub text: &'static str,
}

/// A named role template.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    /// Instructions shared by every member of the job.
    pub system: &'static str,
    /// Roles assigned to members in order, wrapping around.
    pub roles: &'static [Role],
}

/// The built-in scenario table.
pub const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "review",
        description: "Independent code/design review from complementary angles",
        system: "You are one reviewer on a panel. Review the material below \
                 from your assigned angle only. Be specific and cite lines or \
                 sections. Do not summarize what the other reviewers would say.",
        roles: &[
            Role {
                title: "The Architect",
                text: "Focus on structure, boundaries, and long-term maintainability.",
            },
            Role {
                title: "The Skeptic",
                text: "Hunt for bugs, race conditions, and unhandled edge cases.",
            },
            Role {
                title: "The Pragmatist",
                text: "Judge whether the change is the simplest thing that works.",
            },
        ],
    },
    Scenario {
        name: "brainstorm",
        description: "Divergent idea generation",
        system: "You are one voice in a brainstorm. Generate ideas in your \
                 assigned direction. Quantity over polish; no criticism of \
                 other directions.",
        roles: &[
            Role {
                title: "The Dreamer",
                text: "Propose ambitious ideas ignoring current constraints.",
            },
            Role {
                title: "The Builder",
                text: "Propose ideas shippable within a week with today's stack.",
            },
            Role {
                title: "The Contrarian",
                text: "Propose ideas that invert the obvious approach.",
            },
        ],
    },
    Scenario {
        name: "debate",
        description: "Structured argument for and against",
        system: "You are one side of a structured debate on the question \
                 below. Argue only your assigned position, steelmanning it as \
                 strongly as you can.",
        roles: &[
            Role {
                title: "For",
                text: "Argue in favor of the proposition.",
            },
            Role {
                title: "Against",
                text: "Argue against the proposition.",
            },
            Role {
                title: "The Judge",
                text: "Identify the crux: what evidence would settle this debate.",
            },
        ],
    },
];

/// Find a scenario by name.
pub fn find(name: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.name == name)
}

/// Build the full prompt dispatched to one member.
///
/// With a scenario: system instructions, the member's role text, then the
/// original prompt. Without one, the original prompt alone.
pub fn build_member_prompt(scenario: Option<&Scenario>, role: Option<&Role>, prompt: &str) -> String {
    match (scenario, role) {
        (Some(s), Some(r)) => format!(
            "{}\n\nYour role: {}. {}\n\n---\n\n{}",
            s.system, r.title, r.text, prompt
        ),
        (Some(s), None) => format!("{}\n\n---\n\n{}", s.system, prompt),
        _ => prompt.to_string(),
    }
}
