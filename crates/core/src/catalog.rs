//! Persisted action vocabulary: what a profile step is, and the fields
//! a condition may inspect.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    #[serde(rename = "/attack")]
    Attack,
    #[serde(rename = "/assist")]
    Assist,
    #[serde(rename = "/assistpartymember")]
    AssistPartyMember,
    #[serde(rename = "/target")]
    Target,
    #[serde(rename = "/targetnext")]
    TargetNext,
    #[serde(rename = "/aitargetnext")]
    AiTargetNext,
    #[serde(rename = "/delay")]
    Delay,
    #[serde(rename = "/press")]
    Press,
    #[serde(rename = "/pickup")]
    Pickup,
    #[serde(rename = "/stop")]
    Stop,
    #[serde(rename = "/unstuck")]
    Unstuck,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Combinator {
    #[default]
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    TargetHp,
    MyHp,
    MyMp,
    SinceLastSuccessTarget,
    FullTargetHpUnchangedSince,
    #[serde(rename = "party_member_hp_1")]
    PartyMemberHp1,
    #[serde(rename = "party_member_hp_2")]
    PartyMemberHp2,
    #[serde(rename = "party_member_hp_3")]
    PartyMemberHp3,
    #[serde(rename = "party_member_hp_4")]
    PartyMemberHp4,
    #[serde(rename = "party_member_hp_5")]
    PartyMemberHp5,
    #[serde(rename = "party_member_hp_6")]
    PartyMemberHp6,
    #[serde(rename = "party_member_hp_7")]
    PartyMemberHp7,
    #[serde(rename = "party_member_hp_8")]
    PartyMemberHp8,
    #[serde(other)]
    Unknown,
}

impl Field {
    /// Party slot (1..=8) for the `party_member_hp_N` fields.
    pub fn party_slot(self) -> Option<u8> {
        match self {
            Field::PartyMemberHp1 => Some(1),
            Field::PartyMemberHp2 => Some(2),
            Field::PartyMemberHp3 => Some(3),
            Field::PartyMemberHp4 => Some(4),
            Field::PartyMemberHp5 => Some(5),
            Field::PartyMemberHp6 => Some(6),
            Field::PartyMemberHp7 => Some(7),
            Field::PartyMemberHp8 => Some(8),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "=")]
    Eq,
    #[serde(other)]
    Unknown,
}

impl Operator {
    pub fn holds(self, left: f64, right: f64) -> bool {
        match self {
            Operator::Gt => left > right,
            Operator::Lt => left < right,
            Operator::Eq => left == right,
            Operator::Unknown => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub id: String,
    pub field: Field,
    pub operator: Operator,
    #[serde(default)]
    pub value_source: String,
    /// Empty means "ignore this condition".
    #[serde(default)]
    pub value: String,
}

impl Condition {
    pub fn new(field: Field, operator: Operator, value: &str) -> Self {
        Self {
            id: String::new(),
            field,
            operator,
            value_source: String::new(),
            value: value.to_string(),
        }
    }
}

/// One step of a profile. `action` may be absent in stored files; such
/// steps are dropped when a working list is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    #[serde(rename = "Action", default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionKind>,
    #[serde(rename = "Binding", default)]
    pub binding: String,
    #[serde(rename = "period_milliseconds", default)]
    pub period_ms: u64,
    #[serde(rename = "delay_milliseconds", default)]
    pub delay_ms: u64,
    #[serde(rename = "Additional", default)]
    pub additional: String,
    #[serde(rename = "Conditions", default)]
    pub conditions: Vec<Condition>,
    #[serde(rename = "conditions_combinator", default)]
    pub combinator: Combinator,
}

impl ActionItem {
    pub fn new(kind: ActionKind, binding: &str) -> Self {
        Self {
            action: Some(kind),
            binding: binding.to_string(),
            period_ms: 0,
            delay_ms: 0,
            additional: String::new(),
            conditions: Vec::new(),
            combinator: Combinator::And,
        }
    }

    pub fn with_period(mut self, ms: u64) -> Self {
        self.period_ms = ms;
        self
    }

    pub fn with_condition(mut self, c: Condition) -> Self {
        self.conditions.push(c);
        self
    }

    pub fn with_additional(mut self, a: &str) -> Self {
        self.additional = a.to_string();
        self
    }

    /// Kind, if the step is runnable.
    pub fn kind(&self) -> Option<ActionKind> {
        self.action.filter(|k| *k != ActionKind::Unknown)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    #[serde(rename = "Id", default)]
    pub id: u32,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Items", default)]
    pub items: Vec<ActionItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilePreset {
    pub preset: Preset,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileTemplate {
    pub name: String,
    #[serde(default)]
    pub items: Vec<ProfilePreset>,
}

impl ProfileTemplate {
    /// Runnable steps of every active preset, in order.
    pub fn action_items(&self) -> Vec<ActionItem> {
        self.items
            .iter()
            .filter(|p| p.is_active)
            .flat_map(|p| p.preset.items.iter())
            .filter(|item| item.kind().is_some())
            .cloned()
            .collect()
    }
}
