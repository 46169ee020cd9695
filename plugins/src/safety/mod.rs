mod rules;

pub use rules::RuleSafetyValidator;
