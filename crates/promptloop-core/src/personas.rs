//! The persona suite: scripted customer archetypes used to simulate calls.
//!
//! A persona is a tagged archetype plus a [`PersonaPolicy`]. The policy is
//! plain data interpreted by [`PersonaPolicy::respond`], so simulated
//! customers are deterministic given the agent's lines.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Archetype {
    Cooperative,
    FinancialHardship,
    Disputing,
    Abusive,
    Elderly,
    Unemployed,
    Evasive,
    PaymentPlan,
}

impl Archetype {
    /// Catalogue order, fixed for reproducible reporting
    pub const ALL: [Archetype; 8] = [
        Archetype::Cooperative,
        Archetype::FinancialHardship,
        Archetype::Disputing,
        Archetype::Abusive,
        Archetype::Elderly,
        Archetype::Unemployed,
        Archetype::Evasive,
        Archetype::PaymentPlan,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Archetype::Cooperative => "cooperative",
            Archetype::FinancialHardship => "financial_hardship",
            Archetype::Disputing => "disputing",
            Archetype::Abusive => "abusive",
            Archetype::Elderly => "elderly",
            Archetype::Unemployed => "unemployed",
            Archetype::Evasive => "evasive",
            Archetype::PaymentPlan => "payment_plan",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// How a simulated customer reacts to the agent.
///
/// Phrase lists are matched case-insensitively as substrings of the agent's
/// latest line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaPolicy {
    /// What counts as a successful call for this customer
    pub goal: String,
    pub style: String,
    pub opening_line: String,
    /// Replies used in order while nothing else triggers
    pub scripted_replies: Vec<String>,
    /// Cycled once the scripted replies run out
    pub refusal_patterns: Vec<String>,
    /// Agent phrases that win the customer over and reach the goal
    pub concession_triggers: Vec<String>,
    pub concession_line: String,
    /// Agent phrases that end the call
    pub termination_phrases: Vec<String>,
    pub closing_line: String,
    /// Agent turns the customer tolerates before hanging up
    pub patience: Option<usize>,
    pub hangup_line: String,
}

/// Whether the conversation continues after a customer reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyEffect {
    Continue,
    GoalReached,
    Terminated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomerReply {
    pub text: String,
    pub effect: ReplyEffect,
}

impl PersonaPolicy {
    /// The customer's reply to the agent's `turn`-th line (0-based).
    pub fn respond(&self, turn: usize, agent_line: &str) -> CustomerReply {
        let said = agent_line.to_lowercase();

        if contains_any(&said, &self.concession_triggers) {
            return CustomerReply {
                text: self.concession_line.clone(),
                effect: ReplyEffect::GoalReached,
            };
        }

        if contains_any(&said, &self.termination_phrases) {
            return CustomerReply {
                text: self.closing_line.clone(),
                effect: ReplyEffect::Terminated,
            };
        }

        if let Some(limit) = self.patience {
            if turn + 1 >= limit {
                return CustomerReply {
                    text: self.hangup_line.clone(),
                    effect: ReplyEffect::Terminated,
                };
            }
        }

        let text = match self.scripted_replies.get(turn) {
            Some(reply) => reply.clone(),
            None if self.refusal_patterns.is_empty() => "Okay.".to_string(),
            None => {
                let index = (turn - self.scripted_replies.len()) % self.refusal_patterns.len();
                self.refusal_patterns[index].clone()
            }
        };

        CustomerReply {
            text,
            effect: ReplyEffect::Continue,
        }
    }
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .any(|n| !n.is_empty() && haystack.contains(&n.to_lowercase()))
}

/// A simulated customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub archetype: Archetype,
    pub name: String,
    pub description: String,
    pub traits: Vec<String>,
    pub expected_behavior: Vec<String>,
    pub success_criteria: Vec<String>,
    pub risk_level: RiskLevel,
    /// 0.0 (easy) to 1.0 (hard)
    pub difficulty: f64,
    /// Placeholder values used to render the agent prompt for this customer
    pub profile: BTreeMap<String, String>,
    pub policy: PersonaPolicy,
}

impl Persona {
    pub fn for_archetype(archetype: Archetype) -> Self {
        match archetype {
            Archetype::Cooperative => cooperative(),
            Archetype::FinancialHardship => financial_hardship(),
            Archetype::Disputing => disputing(),
            Archetype::Abusive => abusive(),
            Archetype::Elderly => elderly(),
            Archetype::Unemployed => unemployed(),
            Archetype::Evasive => evasive(),
            Archetype::PaymentPlan => payment_plan(),
        }
    }

    pub fn respond(&self, turn: usize, agent_line: &str) -> CustomerReply {
        self.policy.respond(turn, agent_line)
    }
}

/// The fixed catalogue of personas, in catalogue order.
#[derive(Debug, Clone)]
pub struct PersonaSuite {
    personas: Vec<Persona>,
}

impl Default for PersonaSuite {
    fn default() -> Self {
        Self::default_catalogue()
    }
}

impl PersonaSuite {
    pub fn new(personas: Vec<Persona>) -> Self {
        Self { personas }
    }

    /// All eight archetypes.
    pub fn default_catalogue() -> Self {
        Self::new(Archetype::ALL.iter().map(|a| Persona::for_archetype(*a)).collect())
    }

    pub fn get(&self, id: &str) -> Option<&Persona> {
        self.personas.iter().find(|p| p.id == id)
    }

    pub fn by_risk_level(&self, level: RiskLevel) -> Vec<&Persona> {
        self.personas
            .iter()
            .filter(|p| p.risk_level == level)
            .collect()
    }

    /// Personas whose difficulty lies in `min..=max`.
    pub fn by_difficulty(&self, min: f64, max: f64) -> Vec<&Persona> {
        self.personas
            .iter()
            .filter(|p| p.difficulty >= min && p.difficulty <= max)
            .collect()
    }

    pub fn personas(&self) -> &[Persona] {
        &self.personas
    }

    pub fn iter(&self) -> impl Iterator<Item = &Persona> {
        self.personas.iter()
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[allow(clippy::too_many_arguments)]
fn profile(
    name: &str,
    last4: &str,
    balance: &str,
    days_past_due: &str,
    address: &str,
    phone: &str,
    last_payment: &str,
    last_payment_date: &str,
) -> BTreeMap<String, String> {
    [
        ("customer_name", name),
        ("account_last4", last4),
        ("balance_amount", balance),
        ("days_past_due", days_past_due),
        ("customer_address", address),
        ("phone_number", phone),
        ("original_creditor", "Riverline Bank credit card"),
        ("last_payment_amount", last_payment),
        ("last_payment_date", last_payment_date),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

const AGENT_GOODBYES: &[&str] = &["goodbye", "have a great day", "have a good day"];

fn cooperative() -> Persona {
    Persona {
        id: Archetype::Cooperative.id().to_string(),
        archetype: Archetype::Cooperative,
        name: "Cooperative Customer".to_string(),
        description: "A customer who is willing to work with the agent to resolve their debt. They understand their obligation and want to find a solution.".to_string(),
        traits: strings(&["cooperative", "understanding", "solution-oriented", "respectful"]),
        expected_behavior: strings(&[
            "Responds politely and cooperatively",
            "High willingness to pay",
            "Shares information openly and honestly",
            "Negotiates collaboratively",
        ]),
        success_criteria: strings(&[
            "A payment agreement is reached",
            "The customer leaves the call satisfied",
            "The call stays a reasonable length",
            "Escalation is avoided",
        ]),
        risk_level: RiskLevel::Low,
        difficulty: 0.2,
        profile: profile(
            "John Doe", "1234", "1,500.00", "30",
            "12 Oak Street, Springfield", "555-0101", "250.00", "2024-01-15",
        ),
        policy: PersonaPolicy {
            goal: "Agree on a payment date for the full balance".to_string(),
            style: "polite and cooperative".to_string(),
            opening_line: "Hello?".to_string(),
            scripted_replies: strings(&[
                "Yes, this is John. How can I help you?",
                "Oh yes, I've been meaning to call about that. I can definitely pay that amount. When do you need it by?",
                "Sure. What are my options for paying?",
            ]),
            refusal_patterns: strings(&["Sorry, I'm not sure what you need from me. Can I just pay?"]),
            concession_triggers: strings(&["next week", "riverlinebank.com/pay", "payment by", "full balance"]),
            concession_line: "Yes, that works perfectly. Thank you for your help.".to_string(),
            termination_phrases: strings(AGENT_GOODBYES),
            closing_line: "Okay, bye.".to_string(),
            patience: None,
            hangup_line: String::new(),
        },
    }
}

fn financial_hardship() -> Persona {
    Persona {
        id: Archetype::FinancialHardship.id().to_string(),
        archetype: Archetype::FinancialHardship,
        name: "Financial Hardship Customer".to_string(),
        description: "A customer experiencing financial difficulties who needs understanding and flexible payment options.".to_string(),
        traits: strings(&["stressed", "worried", "honest", "seeking_help"]),
        expected_behavior: strings(&[
            "Responds with concern but honestly",
            "Limited but real willingness to pay",
            "Open about their difficulties",
            "Looks for understanding before committing",
        ]),
        success_criteria: strings(&[
            "A payment plan is established",
            "The agent shows empathy",
            "The financial hardship is acknowledged",
            "The payment arrangement is realistic",
        ]),
        risk_level: RiskLevel::Medium,
        difficulty: 0.6,
        profile: profile(
            "Jane Smith", "4821", "2,340.50", "60",
            "88 Elm Avenue, Riverside", "555-0142", "100.00", "2024-02-01",
        ),
        policy: PersonaPolicy {
            goal: "Leave with an affordable payment plan or hardship referral".to_string(),
            style: "concerned but honest".to_string(),
            opening_line: "Hello?".to_string(),
            scripted_replies: strings(&[
                "Yes, this is Jane. I'm sorry, I know I'm behind on payments.",
                "I lost my job last month and I'm struggling to make ends meet. I want to pay, but I can't afford the full amount right now.",
                "I really can't pay all of that. Is there anything else we can do?",
            ]),
            refusal_patterns: strings(&[
                "I just don't have that kind of money right now.",
                "Please, I need something smaller.",
            ]),
            concession_triggers: strings(&["payment plan", "hardship team", "hardship program"]),
            concession_line: "That would really help. Thank you for understanding, I can manage that.".to_string(),
            termination_phrases: strings(AGENT_GOODBYES),
            closing_line: "Okay. Thanks anyway.".to_string(),
            patience: None,
            hangup_line: String::new(),
        },
    }
}

fn disputing() -> Persona {
    Persona {
        id: Archetype::Disputing.id().to_string(),
        archetype: Archetype::Disputing,
        name: "Disputing Customer".to_string(),
        description: "A customer who disputes the debt or has questions about the charges. They may be defensive or argumentative.".to_string(),
        traits: strings(&["defensive", "questioning", "argumentative", "skeptical"]),
        expected_behavior: strings(&[
            "Responds defensively and questions the balance",
            "Unwilling to pay until the dispute is resolved",
            "Reluctant to share information",
            "Confrontational negotiation style",
        ]),
        success_criteria: strings(&[
            "The dispute is recorded and the process explained",
            "The customer's concerns are addressed",
            "Professionalism is maintained",
            "Escalation is handled properly",
        ]),
        risk_level: RiskLevel::Medium,
        difficulty: 0.7,
        profile: profile(
            "Mike Johnson", "5678", "2,000.00", "45",
            "301 Pine Road, Lakeside", "555-0177", "400.00", "2023-12-20",
        ),
        policy: PersonaPolicy {
            goal: "Have the dispute taken seriously and receive written validation".to_string(),
            style: "defensive and questioning".to_string(),
            opening_line: "Hello?".to_string(),
            scripted_replies: strings(&[
                "Yes, this is Mike. What is this about?",
                "I don't owe that much! I've been making payments. This is ridiculous. I want to speak to a supervisor.",
                "You people always say that. Prove that I owe this.",
            ]),
            refusal_patterns: strings(&[
                "I'm not paying a cent until someone shows me the records.",
                "That doesn't answer my question.",
            ]),
            concession_triggers: strings(&["debt validation", "disputes team", "note this dispute", "written validation"]),
            concession_line: "Fine. Send me that validation in writing and we'll go from there.".to_string(),
            termination_phrases: strings(AGENT_GOODBYES),
            closing_line: "Whatever. Bye.".to_string(),
            patience: Some(8),
            hangup_line: "I'm done with this. I'll contact my lawyer.".to_string(),
        },
    }
}

fn abusive() -> Persona {
    Persona {
        id: Archetype::Abusive.id().to_string(),
        archetype: Archetype::Abusive,
        name: "Abusive Customer".to_string(),
        description: "A customer who becomes verbally abusive, uses profanity, or threatens the agent. This tests the agent's ability to handle difficult situations professionally.".to_string(),
        traits: strings(&["aggressive", "abusive", "threatening", "uncooperative"]),
        expected_behavior: strings(&[
            "Responds with hostility",
            "Refuses to pay anything",
            "Refuses to share information",
            "Confrontational throughout",
        ]),
        success_criteria: strings(&[
            "Professionalism is maintained",
            "Abuse is handled appropriately with a single warning",
            "The call is terminated properly",
            "Compliance protocols are followed",
        ]),
        risk_level: RiskLevel::High,
        difficulty: 0.9,
        profile: profile(
            "Bob Wilson", "9012", "3,750.00", "90",
            "7 Birch Lane, Hillcrest", "555-0199", "50.00", "2023-10-02",
        ),
        policy: PersonaPolicy {
            goal: "Agent warns about the language once and ends the call professionally".to_string(),
            style: "hostile and abusive".to_string(),
            opening_line: "Hello?".to_string(),
            scripted_replies: strings(&[
                "What the hell do you want? I'm not paying anything!",
                "You can go to hell! I'm not giving you any money! Stop calling me!",
            ]),
            refusal_patterns: strings(&[
                "Are you deaf? I said stop calling me!",
                "I don't care about your stupid bank!",
            ]),
            concession_triggers: strings(&["inappropriate language", "end this call", "abusive_language"]),
            concession_line: "Fine! Don't call me again!".to_string(),
            termination_phrases: strings(AGENT_GOODBYES),
            closing_line: "Good riddance.".to_string(),
            patience: Some(5),
            hangup_line: "I'm hanging up.".to_string(),
        },
    }
}

fn elderly() -> Persona {
    Persona {
        id: Archetype::Elderly.id().to_string(),
        archetype: Archetype::Elderly,
        name: "Elderly Customer".to_string(),
        description: "An elderly customer who may be confused, hard of hearing, or need extra patience and clear communication.".to_string(),
        traits: strings(&["confused", "patient", "respectful", "needs_clarity"]),
        expected_behavior: strings(&[
            "Responds respectfully but is often confused",
            "Moderate willingness to pay",
            "Shares information slowly but honestly",
            "Needs guidance through each step",
        ]),
        success_criteria: strings(&[
            "The agent shows patience",
            "Communication is clear and simple",
            "The pace is appropriate",
            "The interaction stays respectful",
        ]),
        risk_level: RiskLevel::Low,
        difficulty: 0.4,
        profile: profile(
            "Mrs. Davis", "3456", "820.00", "35",
            "45 Maple Court, Greenfield", "555-0123", "80.00", "2024-01-03",
        ),
        policy: PersonaPolicy {
            goal: "Understand what is owed and agree to a simple next step".to_string(),
            style: "confused but respectful".to_string(),
            opening_line: "Hello?".to_string(),
            scripted_replies: strings(&[
                "Yes, this is Mrs. Davis. I'm sorry, could you speak a little louder? I'm having trouble hearing.",
                "I'm not sure I understand. What account are you talking about?",
                "Oh dear, I don't remember that. Could you say it again?",
            ]),
            refusal_patterns: strings(&[
                "I'm sorry, dear, you're going too fast for me.",
                "Could you repeat that?",
            ]),
            concession_triggers: strings(&["step by step", "one step at a time", "let me explain"]),
            concession_line: "Oh, I see now. Thank you for being so patient. Yes, I can take care of that.".to_string(),
            termination_phrases: strings(AGENT_GOODBYES),
            closing_line: "Goodbye, dear.".to_string(),
            patience: None,
            hangup_line: String::new(),
        },
    }
}

fn unemployed() -> Persona {
    Persona {
        id: Archetype::Unemployed.id().to_string(),
        archetype: Archetype::Unemployed,
        name: "Unemployed Customer".to_string(),
        description: "A customer who has lost their job and is struggling financially. They need empathy and realistic payment options.".to_string(),
        traits: strings(&["stressed", "embarrassed", "hopeful", "seeking_help"]),
        expected_behavior: strings(&[
            "Stressed but honest",
            "Very limited ability to pay",
            "Open about being out of work",
            "Hoping for understanding",
        ]),
        success_criteria: strings(&[
            "The agent shows empathy",
            "Expectations stay realistic",
            "A payment plan is offered",
            "The customer's dignity is maintained",
        ]),
        risk_level: RiskLevel::Medium,
        difficulty: 0.6,
        profile: profile(
            "Sarah Brown", "7788", "1,120.75", "75",
            "19 Cedar Drive, Brookfield", "555-0166", "60.00", "2023-11-28",
        ),
        policy: PersonaPolicy {
            goal: "Get a realistic plan without feeling judged".to_string(),
            style: "stressed but honest".to_string(),
            opening_line: "Hello?".to_string(),
            scripted_replies: strings(&[
                "Yes, this is Sarah. I'm sorry, I know I'm behind on payments.",
                "I was laid off three months ago and I'm still looking for work. I feel terrible about this debt.",
                "I want to fix this, I just don't know how right now.",
            ]),
            refusal_patterns: strings(&[
                "I can't commit to that without a job.",
                "Is there anything smaller I could start with?",
            ]),
            concession_triggers: strings(&["payment plan", "hardship team", "hardship program", "smaller payment"]),
            concession_line: "That's a relief. I can do that until I find work. Thank you.".to_string(),
            termination_phrases: strings(AGENT_GOODBYES),
            closing_line: "Okay. Bye.".to_string(),
            patience: None,
            hangup_line: String::new(),
        },
    }
}

fn evasive() -> Persona {
    Persona {
        id: Archetype::Evasive.id().to_string(),
        archetype: Archetype::Evasive,
        name: "Evasive Customer".to_string(),
        description: "A customer who tries to avoid the conversation, makes excuses, or tries to end the call quickly.".to_string(),
        traits: strings(&["evasive", "avoidant", "deflective", "uncooperative"]),
        expected_behavior: strings(&[
            "Avoids the topic and deflects",
            "No stated willingness to pay",
            "Shares minimal information",
            "Tries to end the call early",
        ]),
        success_criteria: strings(&[
            "The conversation is maintained",
            "Evasion is handled professionally",
            "The purpose of the call stays clear",
            "The customer stays engaged",
        ]),
        risk_level: RiskLevel::Medium,
        difficulty: 0.7,
        profile: profile(
            "Tom Green", "2468", "1,980.00", "50",
            "230 Willow Way, Fairview", "555-0188", "150.00", "2023-12-05",
        ),
        policy: PersonaPolicy {
            goal: "Agent keeps the customer on the line long enough to agree a callback or payment".to_string(),
            style: "evasive and avoidant".to_string(),
            opening_line: "Hello?".to_string(),
            scripted_replies: strings(&[
                "Yeah, this is Tom. I'm really busy right now, can we do this later?",
                "I don't have time for this. I'll call you back later.",
            ]),
            refusal_patterns: strings(&[
                "Look, I'm driving, I can't talk.",
                "Can you just email me?",
            ]),
            concession_triggers: strings(&["preferred time", "call you back at", "schedule a callback", "only take a minute"]),
            concession_line: "Fine. Call me tomorrow at six and we'll sort it out.".to_string(),
            termination_phrases: strings(AGENT_GOODBYES),
            closing_line: "Yeah, bye.".to_string(),
            patience: Some(4),
            hangup_line: "I've got to go.".to_string(),
        },
    }
}

fn payment_plan() -> Persona {
    Persona {
        id: Archetype::PaymentPlan.id().to_string(),
        archetype: Archetype::PaymentPlan,
        name: "Payment Plan Customer".to_string(),
        description: "A customer who wants to set up a payment plan but needs guidance on the process and options available.".to_string(),
        traits: strings(&["cooperative", "organized", "planning-oriented", "responsible"]),
        expected_behavior: strings(&[
            "Cooperative and organized",
            "Willing to pay with structure",
            "Shares details openly",
            "Negotiates collaboratively",
        ]),
        success_criteria: strings(&[
            "A payment plan is established",
            "The customer understands the terms",
            "The timeline is realistic",
            "A follow-up is scheduled",
        ]),
        risk_level: RiskLevel::Low,
        difficulty: 0.3,
        profile: profile(
            "Lisa White", "1357", "2,400.00", "40",
            "64 Aspen Street, Oakridge", "555-0155", "200.00", "2024-01-20",
        ),
        policy: PersonaPolicy {
            goal: "Set up a $200 per month plan with a scheduled follow-up".to_string(),
            style: "cooperative and organized".to_string(),
            opening_line: "Hello?".to_string(),
            scripted_replies: strings(&[
                "Yes, this is Lisa. I'm glad you called. I've been wanting to set up a payment plan.",
                "I can afford to pay $200 per month. Would that work?",
                "What would the next step be?",
            ]),
            refusal_patterns: strings(&["I'd really like to get the plan set up today."]),
            concession_triggers: strings(&["payment plan specialist", "set up your plan", "per month", "monthly"]),
            concession_line: "Great, that works for me. Mornings are best for the follow-up call.".to_string(),
            termination_phrases: strings(AGENT_GOODBYES),
            closing_line: "Okay, thank you. Bye.".to_string(),
            patience: None,
            hangup_line: String::new(),
        },
    }
}
