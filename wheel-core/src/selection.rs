use rand::Rng;

use crate::{PrizeEntry, WheelError};

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub prize: PrizeEntry,
    pub roll: f64,
    pub total_weight: f64,
}

impl Selection {
    pub fn points_delta(&self) -> i64 {
        self.prize.points_delta
    }
}

pub fn drawable_set(entries: &[PrizeEntry]) -> Vec<&PrizeEntry> {
    let mut drawable: Vec<&PrizeEntry> = entries.iter().filter(|e| e.is_drawable()).collect();
    drawable.sort_by_key(|e| e.id);
    drawable
}

pub fn total_weight(drawable: &[&PrizeEntry]) -> f64 {
    drawable.iter().map(|e| e.weight).sum()
}

/// Returns the first entry whose cumulative weight is strictly greater than
/// `roll`. A roll at or beyond the total lands on the last entry.
pub fn pick<'a>(drawable: &[&'a PrizeEntry], roll: f64) -> Option<&'a PrizeEntry> {
    let mut cumulative = 0.0;
    for entry in drawable {
        cumulative += entry.weight;
        if roll < cumulative {
            return Some(*entry);
        }
    }
    drawable.last().copied()
}

pub fn select<R: Rng + ?Sized>(entries: &[PrizeEntry], rng: &mut R) -> Result<Selection, WheelError> {
    let drawable = drawable_set(entries);
    if drawable.is_empty() {
        return Err(WheelError::NoPrizesAvailable);
    }

    let total = total_weight(&drawable);
    if !total.is_finite() || total <= 0.0 {
        return Err(WheelError::Validation(
            "prize weights do not add up to a finite total".to_string(),
        ));
    }
    let roll = rng.gen_range(0.0..total);
    let prize = pick(&drawable, roll).ok_or(WheelError::NoPrizesAvailable)?;

    Ok(Selection {
        prize: prize.clone(),
        roll,
        total_weight: total,
    })
}
