use chrono::{DateTime, Utc};

use crate::catalog::{Combinator, Condition, Field};
use crate::error::{Error, Result};
use crate::telemetry::{Party, PlayerStat};

/// Decide whether a step may run against the given telemetry.
///
/// Conditions with an empty (or non-numeric) value and conditions on
/// unknown fields take no part in the fold; when nothing is left the
/// result is `true` for either combinator. AND stops at the first failure,
/// OR passes on the first success.
pub fn evaluate(
    combinator: Combinator,
    conditions: &[Condition],
    player: Option<&PlayerStat>,
    party: &Party,
    now: DateTime<Utc>,
) -> Result<bool> {
    let player = player.ok_or(Error::MissingTelemetry)?;

    let mut checked = conditions
        .iter()
        .filter_map(|c| check(c, player, party, now));

    Ok(match combinator {
        Combinator::And => checked.all(|ok| ok),
        Combinator::Or => {
            let mut any_checked = false;
            for ok in checked.by_ref() {
                if ok {
                    return Ok(true);
                }
                any_checked = true;
            }
            !any_checked
        }
    })
}

/// `None` when the condition is to be ignored.
fn check(c: &Condition, player: &PlayerStat, party: &Party, now: DateTime<Utc>) -> Option<bool> {
    let value = c.value.trim();
    if value.is_empty() {
        return None;
    }
    let value: f64 = value.parse().ok()?;

    let ok = match c.field {
        Field::TargetHp => c.operator.holds(player.target.hp_percent, value),
        Field::MyHp => player.hp.percent > 0.0 && c.operator.holds(player.hp.percent, value),
        Field::MyMp => player.mp.percent > 0.0 && c.operator.holds(player.mp.percent, value),
        Field::SinceLastSuccessTarget => {
            since(player.target.hp_was_present_at, c, value, now)
        }
        Field::FullTargetHpUnchangedSince => {
            since(player.target.full_hp_unchanged_since, c, value, now)
        }
        Field::Unknown => return None,
        slot_field => {
            let slot = slot_field.party_slot()?;
            match party.get(&slot) {
                Some(m) => c.operator.holds(m.hp_percent, value),
                None => false,
            }
        }
    };
    Some(ok)
}

// event timestamp OP (now - value seconds); a never-seen event is the epoch
fn since(event: Option<DateTime<Utc>>, c: &Condition, secs: f64, now: DateTime<Utc>) -> bool {
    let event = event.map_or(0, |t| t.timestamp()) as f64;
    let threshold = now.timestamp() as f64 - secs;
    c.operator.holds(event, threshold)
}
