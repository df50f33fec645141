//! Resource catalog - Plans, their specs and prices

use serde::{Deserialize, Serialize};

use super::error::{VpsError, VpsResult};

/// Purchasable VPS plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Plan {
    Starter,
    Basic,
    Standard,
    Pro,
}

impl Plan {
    pub fn all() -> &'static [Plan] {
        &[Plan::Starter, Plan::Basic, Plan::Standard, Plan::Pro]
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Starter => "Starter",
            Self::Basic => "Basic",
            Self::Standard => "Standard",
            Self::Pro => "Pro",
        }
    }

    /// Case-insensitive lookup by name
    pub fn parse(name: &str) -> VpsResult<Self> {
        let wanted = name.trim();
        Self::all()
            .iter()
            .copied()
            .find(|plan| plan.label().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| VpsError::UnknownPlan(name.to_string()))
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Host processor family a plan is billed against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Processor {
    #[default]
    Intel,
    #[serde(rename = "AMD")]
    Amd,
}

impl Processor {
    pub fn all() -> &'static [Processor] {
        &[Processor::Intel, Processor::Amd]
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Intel => "Intel",
            Self::Amd => "AMD",
        }
    }

    /// Lenient parse: any token starting with "a" is AMD, anything else Intel.
    /// Tokens that are empty or don't start with a letter are rejected.
    pub fn parse(token: &str) -> VpsResult<Self> {
        match token.trim().chars().next() {
            Some(c) if c.eq_ignore_ascii_case(&'a') => Ok(Self::Amd),
            Some(c) if c.is_ascii_alphabetic() => Ok(Self::Intel),
            _ => Err(VpsError::UnknownProcessor(token.to_string())),
        }
    }
}

impl std::fmt::Display for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Resources granted by a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanSpec {
    pub ram_gb: u32,
    pub cpu_cores: u32,
    pub storage_gb_default: u32,
}

pub fn plan_spec(plan: Plan) -> PlanSpec {
    let (ram_gb, cpu_cores, storage_gb_default) = match plan {
        Plan::Starter => (4, 1, 20),
        Plan::Basic => (8, 1, 30),
        Plan::Standard => (12, 2, 50),
        Plan::Pro => (16, 2, 80),
    };
    PlanSpec {
        ram_gb,
        cpu_cores,
        storage_gb_default,
    }
}

/// Price in credits
pub fn price(plan: Plan, processor: Processor) -> u64 {
    match (plan, processor) {
        (Plan::Starter, Processor::Intel) => 42,
        (Plan::Starter, Processor::Amd) => 83,
        (Plan::Basic, Processor::Intel) => 96,
        (Plan::Basic, Processor::Amd) => 164,
        (Plan::Standard, Processor::Intel) => 192,
        (Plan::Standard, Processor::Amd) => 320,
        (Plan::Pro, Processor::Intel) => 220,
        (Plan::Pro, Processor::Amd) => 340,
    }
}

/// Resolve textual plan and processor tokens into a priced quote
pub fn quote(plan: &str, processor: &str) -> VpsResult<Quote> {
    let plan = Plan::parse(plan)?;
    let processor = Processor::parse(processor)?;
    Ok(Quote {
        plan,
        processor,
        spec: plan_spec(plan),
        price: price(plan, processor),
    })
}

/// A resolved plan/processor pair with its spec and price
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub plan: Plan,
    pub processor: Processor,
    pub spec: PlanSpec,
    pub price: u64,
}
