use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::SliceRandom;

use crate::config::SelectionStrategy;
use crate::unit::Subject;

/// Order eligible subjects for claiming.
///
/// `Uniform` is a plain shuffle. `WeightedByStaleness` draws without
/// replacement with probability proportional to `1 + seconds waiting`
/// (Efraimidis-Spirakis keys), so old backlogs go first more often without
/// every worker converging on the same subject.
pub(crate) fn order_candidates<R: Rng>(
    mut subjects: Vec<Subject>,
    strategy: SelectionStrategy,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Vec<Subject> {
    match strategy {
        SelectionStrategy::Uniform => {
            subjects.shuffle(rng);
            subjects
        }
        SelectionStrategy::WeightedByStaleness => {
            let mut keyed: Vec<(f64, Subject)> = subjects
                .into_iter()
                .map(|subject| {
                    let waited = subject
                        .staleness(now)
                        .map(|age| age.num_seconds().max(0) as f64)
                        .unwrap_or(0.0);
                    let weight = 1.0 + waited;
                    let draw: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
                    (draw.powf(1.0 / weight), subject)
                })
                .collect();
            keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
            keyed.into_iter().map(|(_, subject)| subject).collect()
        }
    }
}
