use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

mod selection;

pub use selection::{drawable_set, pick, select, total_weight, Selection};

pub type PrizeId = u64;
pub type UserId = String;

pub const DEFAULT_COLOR: &str = "#4CAF50";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Prize,
    Penalty,
    Bonus,
    Wildcard,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Prize => "prize",
            Category::Penalty => "penalty",
            Category::Bonus => "bonus",
            Category::Wildcard => "wildcard",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = WheelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prize" => Ok(Category::Prize),
            "penalty" => Ok(Category::Penalty),
            "bonus" => Ok(Category::Bonus),
            "wildcard" => Ok(Category::Wildcard),
            other => Err(WheelError::Validation(format!("unknown category: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "Option<u32>", into = "Option<u32>")]
pub enum Stock {
    Unlimited,
    Limited(u32),
}

impl Stock {
    pub fn is_available(&self) -> bool {
        match self {
            Stock::Unlimited => true,
            Stock::Limited(left) => *left > 0,
        }
    }

    pub fn take_one(self) -> Option<Stock> {
        match self {
            Stock::Unlimited => Some(Stock::Unlimited),
            Stock::Limited(0) => None,
            Stock::Limited(left) => Some(Stock::Limited(left - 1)),
        }
    }

    pub fn give_back(self) -> Stock {
        match self {
            Stock::Unlimited => Stock::Unlimited,
            Stock::Limited(left) => Stock::Limited(left.saturating_add(1)),
        }
    }

    fn from_raw(raw: Option<i64>) -> Result<Stock, WheelError> {
        match raw {
            None => Ok(Stock::Unlimited),
            Some(n) if n < 0 => Err(WheelError::Validation(
                "stock must not be negative".to_string(),
            )),
            Some(n) => u32::try_from(n)
                .map(Stock::Limited)
                .map_err(|_| WheelError::Validation("stock is too large".to_string())),
        }
    }
}

impl From<Option<u32>> for Stock {
    fn from(raw: Option<u32>) -> Self {
        raw.map(Stock::Limited).unwrap_or(Stock::Unlimited)
    }
}

impl From<Stock> for Option<u32> {
    fn from(stock: Stock) -> Self {
        match stock {
            Stock::Unlimited => None,
            Stock::Limited(left) => Some(left),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrizeEntry {
    pub id: PrizeId,
    pub label: String,
    pub category: Category,
    pub points_delta: i64,
    pub stock: Stock,
    pub weight: f64,
    pub color: String,
    pub active: bool,
    pub image_url: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl PrizeEntry {
    pub fn is_drawable(&self) -> bool {
        self.active && self.stock.is_available() && valid_weight(self.weight)
    }

    pub fn apply_patch(&self, patch: PrizePatch, now: u64) -> Result<PrizeEntry, WheelError> {
        let mut next = self.clone();
        if let Some(label) = patch.label {
            next.label = validate_label(&label)?;
        }
        if let Some(category) = patch.category {
            next.category = category;
        }
        if let Some(points_delta) = patch.points_delta {
            next.points_delta = points_delta;
        }
        if let Some(stock) = patch.stock {
            next.stock = Stock::from_raw(stock)?;
        }
        if let Some(weight) = patch.weight {
            next.weight = validate_weight(weight)?;
        }
        if let Some(color) = patch.color {
            next.color = color;
        }
        if let Some(active) = patch.active {
            next.active = active;
        }
        if let Some(image_url) = patch.image_url {
            next.image_url = image_url;
        }
        next.updated_at = now;
        Ok(next)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrizeSpec {
    pub label: String,
    pub category: Category,
    pub points_delta: i64,
    pub stock: Option<i64>,
    pub weight: f64,
    pub color: Option<String>,
    pub image_url: Option<String>,
}

impl PrizeSpec {
    pub fn validate(&self) -> Result<(), WheelError> {
        validate_label(&self.label)?;
        validate_weight(self.weight)?;
        Stock::from_raw(self.stock)?;
        Ok(())
    }

    pub fn into_entry(self, id: PrizeId, now: u64) -> Result<PrizeEntry, WheelError> {
        let label = validate_label(&self.label)?;
        let weight = validate_weight(self.weight)?;
        let stock = Stock::from_raw(self.stock)?;
        Ok(PrizeEntry {
            id,
            label,
            category: self.category,
            points_delta: self.points_delta,
            stock,
            weight,
            color: self
                .color
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_COLOR.to_string()),
            active: true,
            image_url: self.image_url,
            created_at: now,
            updated_at: now,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrizePatch {
    pub label: Option<String>,
    pub category: Option<Category>,
    pub points_delta: Option<i64>,
    pub stock: Option<Option<i64>>,
    pub weight: Option<f64>,
    pub color: Option<String>,
    pub active: Option<bool>,
    pub image_url: Option<Option<String>>,
}

fn validate_label(label: &str) -> Result<String, WheelError> {
    let label = label.trim();
    if label.is_empty() {
        return Err(WheelError::Validation("label must not be empty".to_string()));
    }
    Ok(label.to_string())
}

pub const MAX_WEIGHT: f64 = 1e9;

fn valid_weight(weight: f64) -> bool {
    weight.is_finite() && weight > 0.0 && weight <= MAX_WEIGHT
}

fn validate_weight(weight: f64) -> Result<f64, WheelError> {
    if !valid_weight(weight) {
        return Err(WheelError::Validation(format!(
            "weight must be a positive number no greater than {MAX_WEIGHT}"
        )));
    }
    Ok(weight)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserAccount {
    pub user_id: UserId,
    pub points_balance: i64,
    pub spin_count: u64,
    pub created_at: u64,
    pub last_spin_at: Option<u64>,
}

impl UserAccount {
    pub fn new(user_id: impl Into<UserId>, starting_balance: i64, now: u64) -> Self {
        Self {
            user_id: user_id.into(),
            points_balance: starting_balance,
            spin_count: 0,
            created_at: now,
            last_spin_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpinRecord {
    pub id: u64,
    pub user_id: UserId,
    pub prize_id: PrizeId,
    pub label: String,
    pub category: Category,
    pub points_delta: i64,
    pub balance_after: i64,
    pub timestamp: u64,
    /// Set once the winner has collected the prize.
    #[serde(default)]
    pub redeemed_at: Option<u64>,
}

impl SpinRecord {
    pub fn redeem(&self, now: u64) -> Result<SpinRecord, WheelError> {
        if self.redeemed_at.is_some() {
            return Err(WheelError::AlreadyRedeemed(self.id));
        }
        Ok(SpinRecord {
            redeemed_at: Some(now),
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalancePolicy {
    #[default]
    AllowNegative,
    ClampAtZero,
}

impl BalancePolicy {
    pub fn apply(&self, balance: i64, delta: i64) -> i64 {
        let next = balance.saturating_add(delta);
        match self {
            BalancePolicy::AllowNegative => next,
            BalancePolicy::ClampAtZero => next.max(0),
        }
    }
}

impl FromStr for BalancePolicy {
    type Err = WheelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow_negative" => Ok(BalancePolicy::AllowNegative),
            "clamp_at_zero" => Ok(BalancePolicy::ClampAtZero),
            other => Err(WheelError::Validation(format!(
                "unknown balance policy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WheelError {
    #[error("{0}")]
    Validation(String),
    #[error("prize {0} not found")]
    NotFound(PrizeId),
    #[error("no prizes available")]
    NoPrizesAvailable,
    #[error("prize {0} is out of stock")]
    Conflict(PrizeId),
    #[error("award {0} not found")]
    AwardNotFound(u64),
    #[error("award {0} was already redeemed")]
    AlreadyRedeemed(u64),
}
