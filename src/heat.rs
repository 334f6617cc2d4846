//! Segment temperature scoring, used to decide warm→cold promotion.

use crate::config::HeatParams;
use crate::store::Segment;

/// `heat = α·visits + β·page_count + γ·exp(-Δhours/τ)`.
///
/// Pure: the caller supplies `now_ms` so results are reproducible. A segment
/// that has never been visited still earns the full recency term.
pub fn segment_heat(segment: &Segment, page_count: usize, now_ms: i64, p: &HeatParams) -> f64 {
    let visits = segment.visit as f64;
    let interactions = page_count as f64;
    let recency = if segment.last_visit > 0 {
        time_decay(segment.last_visit, now_ms, p.tau_hours)
    } else {
        1.0
    };
    p.alpha * visits + p.beta * interactions + p.gamma * recency
}

fn time_decay(event_ms: i64, now_ms: i64, tau_hours: f64) -> f64 {
    let delta_hours = ((now_ms - event_ms) as f64 / 3_600_000.0).max(0.0);
    (-delta_hours / tau_hours).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(visit: i64, last_visit: i64) -> Segment {
        Segment {
            id: 1,
            user_id: 42,
            overview: "test".into(),
            visit,
            last_visit,
        }
    }

    #[test]
    fn hot_segment_exceeds_threshold() {
        // visits=20, pages=3, last visit 1h ago:
        // 20 + 3 + e^(-1/24) ≈ 23.96
        let now = 10 * 3_600_000;
        let s = seg(20, now - 3_600_000);
        let h = segment_heat(&s, 3, now, &HeatParams::default());
        assert!((h - 23.959).abs() < 0.01, "got {h}");
        assert!(h > 15.0);
    }

    #[test]
    fn monotonic_in_visits_and_pages() {
        let now = 1_000_000;
        let p = HeatParams::default();
        let base = segment_heat(&seg(5, now), 2, now, &p);
        assert!(segment_heat(&seg(6, now), 2, now, &p) > base);
        assert!(segment_heat(&seg(5, now), 3, now, &p) > base);
    }

    #[test]
    fn recency_decays_toward_zero() {
        let now = 100 * 24 * 3_600_000_i64;
        let p = HeatParams::default();
        let fresh = segment_heat(&seg(0, now), 0, now, &p);
        let stale = segment_heat(&seg(0, 1), 0, now, &p);
        assert!((fresh - 1.0).abs() < 1e-9);
        assert!(stale < 0.02);
    }

    #[test]
    fn never_visited_gets_full_recency() {
        let h = segment_heat(&seg(0, 0), 1, 5_000_000, &HeatParams::default());
        assert!((h - 2.0).abs() < 1e-9);
    }
}
