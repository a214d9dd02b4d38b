pub mod engine;
pub mod model;

pub use engine::{get_nested, parse_markdown_tables, set_nested, RuleEngine, RuleOutcome, RuleStatus};
pub use model::{Rule, RuleFile, RuleKind, RuleLibrary};
