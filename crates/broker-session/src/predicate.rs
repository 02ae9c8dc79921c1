// §4.6 EventPredicate Engine: ticker-snapshot crossing/threshold detection
// for `awaitEvent`. Pure logic — no I/O, no async — so it's exercised
// directly by unit tests without standing up a socket.

use std::collections::HashMap;

use serde::Deserialize;

/// `{bid, ask, mid, last?, spread, spreadPercent}` derived from a raw
/// ticker payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
    pub last: Option<f64>,
    pub spread: f64,
    pub spread_percent: f64,
}

#[derive(Debug, Deserialize)]
struct RawTicker {
    bid: PriceField,
    ask: PriceField,
    #[serde(default)]
    last: Option<PriceField>,
}

#[derive(Debug, Deserialize)]
struct PriceField {
    price: f64,
}

/// Parse `{bid:{price}, ask:{price}, last?:{price}}` into a [`Snapshot`].
/// Returns `None` if the payload is missing `bid` or `ask`.
pub fn snapshot_from_ticker_payload(payload: &serde_json::Value) -> Option<Snapshot> {
    let raw: RawTicker = serde_json::from_value(payload.clone()).ok()?;
    let mid = (raw.bid.price + raw.ask.price) / 2.0;
    let spread = raw.ask.price - raw.bid.price;
    let spread_percent = if mid > 0.0 { spread / mid * 100.0 } else { 0.0 };
    Some(Snapshot {
        bid: raw.bid.price,
        ask: raw.ask.price,
        mid,
        last: raw.last.map(|p| p.price),
        spread,
        spread_percent,
    })
}

impl Snapshot {
    fn field(&self, field: Field) -> Option<f64> {
        match field {
            Field::Bid => Some(self.bid),
            Field::Ask => Some(self.ask),
            Field::Mid => Some(self.mid),
            Field::Last => self.last,
            Field::Spread => Some(self.spread),
            Field::SpreadPercent => Some(self.spread_percent),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    Bid,
    Ask,
    Mid,
    Last,
    Spread,
    SpreadPercent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Operator {
    #[serde(rename = "GT")]
    Gt,
    #[serde(rename = "GTE")]
    Gte,
    #[serde(rename = "LT")]
    Lt,
    #[serde(rename = "LTE")]
    Lte,
    #[serde(rename = "CROSS_ABOVE")]
    CrossAbove,
    #[serde(rename = "CROSS_BELOW")]
    CrossBelow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Logic {
    #[serde(rename = "ANY")]
    Any,
    #[serde(rename = "ALL")]
    All,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Condition {
    pub field: Field,
    pub operator: Operator,
    pub threshold: f64,
}

/// One entry of an `awaitEvent` request: 1–5 conditions over a single
/// instrument's ticker stream, combined by `logic`.
#[derive(Debug, Clone, Deserialize)]
pub struct PredicateSubscription {
    pub conditions: Vec<Condition>,
    pub logic: Logic,
}

/// A condition that fired, reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggeredCondition {
    pub field: Field,
    pub operator: Operator,
    pub threshold: f64,
    pub actual_value: f64,
}

/// Per-(subscription, field) history needed for `CROSS_ABOVE`/`CROSS_BELOW`.
#[derive(Debug, Default)]
pub struct PredicateState {
    previous: HashMap<Field, f64>,
}

impl PredicateState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate one subscription's conditions against a new snapshot.
    /// Returns the triggered conditions (empty if the subscription's logic
    /// was not satisfied), then refreshes the previous-value memory for
    /// every field present in `snapshot` — but only when the subscription
    /// did *not* fire, per spec (refresh only happens "after each
    /// non-triggering evaluation").
    pub fn evaluate(
        &mut self,
        subscription: &PredicateSubscription,
        snapshot: Snapshot,
    ) -> Vec<TriggeredCondition> {
        let mut triggered = Vec::new();
        for condition in &subscription.conditions {
            let Some(value) = snapshot.field(condition.field) else {
                continue;
            };
            if let Some(hit) = self.check_condition(condition, value) {
                triggered.push(hit);
            }
        }

        let fired = match subscription.logic {
            Logic::Any => !triggered.is_empty(),
            Logic::All => triggered.len() == subscription.conditions.len() && !subscription.conditions.is_empty(),
        };

        if !fired {
            self.refresh(snapshot);
            return Vec::new();
        }

        triggered
    }

    fn check_condition(&self, condition: &Condition, value: f64) -> Option<TriggeredCondition> {
        let hit = match condition.operator {
            Operator::Gt => value > condition.threshold,
            Operator::Gte => value >= condition.threshold,
            Operator::Lt => value < condition.threshold,
            Operator::Lte => value <= condition.threshold,
            Operator::CrossAbove => {
                let Some(previous) = self.previous.get(&condition.field) else {
                    return None;
                };
                *previous <= condition.threshold && value > condition.threshold
            }
            Operator::CrossBelow => {
                let Some(previous) = self.previous.get(&condition.field) else {
                    return None;
                };
                *previous >= condition.threshold && value < condition.threshold
            }
        };
        hit.then_some(TriggeredCondition {
            field: condition.field,
            operator: condition.operator,
            threshold: condition.threshold,
            actual_value: value,
        })
    }

    fn refresh(&mut self, snapshot: Snapshot) {
        self.previous.insert(Field::Bid, snapshot.bid);
        self.previous.insert(Field::Ask, snapshot.ask);
        self.previous.insert(Field::Mid, snapshot.mid);
        if let Some(last) = snapshot.last {
            self.previous.insert(Field::Last, last);
        }
        self.previous.insert(Field::Spread, snapshot.spread);
        self.previous.insert(Field::SpreadPercent, snapshot.spread_percent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker(bid: f64, ask: f64) -> Snapshot {
        snapshot_from_ticker_payload(&serde_json::json!({"bid":{"price":bid},"ask":{"price":ask}})).unwrap()
    }

    #[test]
    fn spread_percent_is_zero_when_mid_is_zero() {
        let snap = ticker(0.0, 0.0);
        assert_eq!(snap.spread_percent, 0.0);
    }

    #[test]
    fn cross_above_never_triggers_on_first_observation() {
        let mut state = PredicateState::new();
        let sub = PredicateSubscription {
            conditions: vec![Condition {
                field: Field::Bid,
                operator: Operator::CrossAbove,
                threshold: 65.0,
            }],
            logic: Logic::Any,
        };
        let triggered = state.evaluate(&sub, ticker(64.0, 65.0));
        assert!(triggered.is_empty());
    }

    #[test]
    fn cross_above_triggers_on_second_observation_crossing_threshold() {
        let mut state = PredicateState::new();
        let sub = PredicateSubscription {
            conditions: vec![Condition {
                field: Field::Bid,
                operator: Operator::CrossAbove,
                threshold: 65.0,
            }],
            logic: Logic::Any,
        };
        state.evaluate(&sub, ticker(64.0, 65.0));
        let triggered = state.evaluate(&sub, ticker(66.0, 67.0));
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].actual_value, 66.0);
    }

    #[test]
    fn all_logic_requires_every_condition_to_trigger() {
        let mut state = PredicateState::new();
        let sub = PredicateSubscription {
            conditions: vec![
                Condition { field: Field::Bid, operator: Operator::Gt, threshold: 65.0 },
                Condition { field: Field::Ask, operator: Operator::Gt, threshold: 70.0 },
            ],
            logic: Logic::All,
        };
        assert!(state.evaluate(&sub, ticker(66.0, 68.0)).is_empty());
        let triggered = state.evaluate(&sub, ticker(66.0, 72.0));
        assert_eq!(triggered.len(), 2);
    }

    #[test]
    fn missing_field_is_skipped_not_failed() {
        let mut state = PredicateState::new();
        let sub = PredicateSubscription {
            conditions: vec![Condition { field: Field::Last, operator: Operator::Gt, threshold: 10.0 }],
            logic: Logic::Any,
        };
        let triggered = state.evaluate(&sub, ticker(1.0, 2.0));
        assert!(triggered.is_empty());
    }

    #[test]
    fn any_logic_fires_on_first_matching_condition() {
        let mut state = PredicateState::new();
        let sub = PredicateSubscription {
            conditions: vec![
                Condition { field: Field::Bid, operator: Operator::Gt, threshold: 100.0 },
                Condition { field: Field::Ask, operator: Operator::Gt, threshold: 1.0 },
            ],
            logic: Logic::Any,
        };
        let triggered = state.evaluate(&sub, ticker(2.0, 3.0));
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].field, Field::Ask);
    }
}
