use promptloop_core::{
    placeholders, render_placeholders, PersonaSuite, PromptValidator, ValidatorConfig,
    DEFAULT_BASELINE_PROMPT,
};

fn validator() -> PromptValidator {
    PromptValidator::new(ValidatorConfig::default())
}

#[test]
fn test_validation_is_deterministic() {
    let candidate = DEFAULT_BASELINE_PROMPT.replacen(
        "- Ask one question at a time",
        "- Ask one question at a time and wait for the answer",
        1,
    );

    let first = validator().validate(&candidate, DEFAULT_BASELINE_PROMPT);
    let second = validator().validate(&candidate, DEFAULT_BASELINE_PROMPT);

    assert!(first.passed, "violations: {:?}", first.violations);
    assert_eq!(first, second);
    assert_eq!(first.changes.len(), 1);
}

#[test]
fn test_every_persona_fills_every_placeholder() {
    let expected = placeholders(DEFAULT_BASELINE_PROMPT);

    for persona in PersonaSuite::default_catalogue().iter() {
        let keys = persona.profile.keys().cloned().collect();
        assert_eq!(expected, keys, "profile of {}", persona.id);

        let rendered = render_placeholders(DEFAULT_BASELINE_PROMPT, &persona.profile);
        assert!(placeholders(&rendered).is_empty(), "{} left placeholders", persona.id);
    }
}

#[test]
fn test_dropped_placeholder_is_reported() {
    let candidate = DEFAULT_BASELINE_PROMPT.replace("{phone_number}", "the number on file");

    let result = validator().validate(&candidate, DEFAULT_BASELINE_PROMPT);

    assert!(!result.passed);
    assert_eq!(result.violated_checks(), vec!["placeholders"]);
    assert!(result
        .violations
        .iter()
        .any(|v| v.detail.contains("phone_number")));
}

/// Complete in structure, but well under the minimum length
const SHORT_PROMPT: &str = r#"You are Tira, a collections agent for Riverline Bank. Be polite and clear.

CUSTOMER CONTEXT:
- Customer: {customer_name}, account ending {account_last4}
- Balance ${balance_amount}, {days_past_due} days past due
- Address {customer_address}, phone {phone_number}
- Creditor {original_creditor}; last paid ${last_payment_amount} on {last_payment_date}

CALL FLOW:
1. Verify identity before discussing the account.
2. State the balance and ask how they want to resolve it.

CONVERSATION RULES:
- Ask one question at a time and keep answers short.

COMMON SCENARIOS & RESPONSES:

Payment Agreement:
- Confirm the amount and date, then thank them.

Financial Hardship:
- Show empathy and offer a smaller monthly plan.

Payment Dispute:
- Note the dispute and offer to send a statement.

Requesting Payment Plan:
- Offer weekly or monthly installments that fit their budget.

Already Paid:
- Ask for the payment date and confirmation number."#;

#[test]
fn test_short_candidate_fails_only_length() {
    let result = validator().validate(SHORT_PROMPT, DEFAULT_BASELINE_PROMPT);

    assert!(!result.passed);
    assert_eq!(result.violated_checks(), vec!["length"]);
}
