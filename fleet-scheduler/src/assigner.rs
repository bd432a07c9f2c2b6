// SPDX-License-Identifier: MIT

use crate::advisor::LoadPredictor;
use fleet_model::geo::{centroid, GeoPoint};
use fleet_model::{FleetError, Mission, MissionKind, Worker};
use fleet_state::WorkerFilter;
use std::collections::HashMap;

const BATTERY_WEIGHT: f64 = 0.7;
const CAPABILITY_WEIGHT: f64 = 0.3;
const ADVISOR_WEIGHT: f64 = 0.2;

/// The chosen worker set, ordered. For area-splitting assignments the
/// order matches `sub_areas`: worker i sweeps sub-area i.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub workers: Vec<String>,
    pub sub_areas: Vec<Vec<GeoPoint>>,
}

/// Hard constraints the mission payload imposes on candidates. These
/// are filters, never weights; an advisor cannot override them.
pub fn hard_filter(mission: &Mission) -> WorkerFilter {
    let params = &mission.payload.params;
    let mut filter = WorkerFilter::default();
    filter.min_battery = params.get("min_battery").and_then(|v| v.parse().ok());
    if let Some(alt) = params.get("required_alt").and_then(|v| v.parse::<f64>().ok()) {
        filter.min_capabilities.insert("max_alt".into(), alt);
    }
    if let Some(payloads) = params.get("required_payload") {
        filter.required_tags =
            payloads.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect();
    }
    filter
}

fn max_distance_m(mission: &Mission) -> Option<f64> {
    mission.payload.params.get("max_distance_m").and_then(|v| v.parse().ok())
}

/// Pure assignment over `(mission, candidates)`. Candidates are assumed
/// to already pass the capability filter; the distance constraint is
/// applied here because it needs the mission's area.
pub fn assign(
    mission: &Mission,
    candidates: &[Worker],
    advisor: &dyn LoadPredictor,
) -> Result<Assignment, FleetError> {
    let area_center = centroid(&mission.payload.area);
    let candidates: Vec<&Worker> = match (max_distance_m(mission), area_center) {
        (Some(max_m), Some(center)) => candidates
            .iter()
            .filter(|w| match &w.position {
                Some(p) => p.haversine_m(&center) <= max_m,
                // Position unknown: the constraint cannot be checked,
                // so the worker is excluded.
                None => false,
            })
            .collect(),
        _ => candidates.iter().collect(),
    };

    if candidates.is_empty() {
        return Err(FleetError::NoFeasibleAssignment);
    }

    match mission.kind {
        MissionKind::SingleWorker => {
            let best = candidates
                .iter()
                .max_by(|a, b| {
                    score(mission, a, advisor)
                        .total_cmp(&score(mission, b, advisor))
                        // Deterministic tie-break: lowest id wins, and
                        // max_by keeps the later of equals.
                        .then_with(|| b.id.cmp(&a.id))
                })
                .expect("candidates non-empty");
            Ok(Assignment {
                workers: vec![best.id.clone()],
                sub_areas: vec![mission.payload.area.clone()],
            })
        }
        MissionKind::MultiWorker | MissionKind::Cluster => {
            let count = mission.requested_workers();
            if candidates.len() < count {
                return Err(FleetError::NoFeasibleAssignment);
            }
            // Keep the `count` best-scoring candidates, then bind each
            // to its nearest sub-region.
            let mut ranked: Vec<&Worker> = candidates.clone();
            ranked.sort_by(|a, b| {
                score(mission, b, advisor)
                    .total_cmp(&score(mission, a, advisor))
                    .then_with(|| a.id.cmp(&b.id))
            });
            ranked.truncate(count);
            let sub_areas = split_area(&mission.payload.area, count);
            let workers = bind_to_regions(&ranked, &sub_areas);
            Ok(Assignment { workers, sub_areas })
        }
    }
}

/// Weighted objective over normalized attributes. Battery dominates by
/// default; advisors subtract a load penalty.
fn score(mission: &Mission, worker: &Worker, advisor: &dyn LoadPredictor) -> f64 {
    let battery = (worker.battery_pct / 100.0).clamp(0.0, 1.0);
    let capability = capability_match(mission, worker);
    let load = advisor.predicted_load(worker).clamp(0.0, 1.0);
    BATTERY_WEIGHT * battery + CAPABILITY_WEIGHT * capability - ADVISOR_WEIGHT * load
}

/// Fraction of the mission's stated requirements the worker satisfies
/// with headroom; 1.0 when the mission asks for nothing in particular.
fn capability_match(mission: &Mission, worker: &Worker) -> f64 {
    let params = &mission.payload.params;
    let mut total = 0u32;
    let mut matched = 0u32;

    if let Some(alt) = params.get("required_alt").and_then(|v| v.parse::<f64>().ok()) {
        total += 1;
        // Headroom above the requirement counts for the full point.
        if worker.capability("max_alt").map(|a| a >= alt * 1.2).unwrap_or(false) {
            matched += 1;
        }
    }
    if let Some(payloads) = params.get("required_payload") {
        for tag in payloads.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            total += 1;
            if worker.has_tag(tag) {
                matched += 1;
            }
        }
    }

    if total == 0 {
        1.0
    } else {
        matched as f64 / total as f64
    }
}

/// Equal-width longitudinal slabs over the area's bounding box. Good
/// enough as the sweep decomposition; a Voronoi split around candidate
/// positions would drop in here.
pub fn split_area(area: &[GeoPoint], count: usize) -> Vec<Vec<GeoPoint>> {
    if area.is_empty() || count == 0 {
        return vec![Vec::new(); count];
    }
    let min_lat = area.iter().map(|p| p.lat).fold(f64::INFINITY, f64::min);
    let max_lat = area.iter().map(|p| p.lat).fold(f64::NEG_INFINITY, f64::max);
    let min_lon = area.iter().map(|p| p.lon).fold(f64::INFINITY, f64::min);
    let max_lon = area.iter().map(|p| p.lon).fold(f64::NEG_INFINITY, f64::max);
    let alt = area.iter().map(|p| p.alt).sum::<f64>() / area.len() as f64;

    let width = (max_lon - min_lon) / count as f64;
    (0..count)
        .map(|i| {
            let west = min_lon + width * i as f64;
            let east = west + width;
            vec![
                GeoPoint::new(min_lat, west, alt),
                GeoPoint::new(min_lat, east, alt),
                GeoPoint::new(max_lat, east, alt),
                GeoPoint::new(max_lat, west, alt),
            ]
        })
        .collect()
}

/// Greedy nearest-pair binding of workers to sub-regions; the result is
/// a bijection ordered by sub-region index. Workers without a position
/// fill the leftover regions in id order.
fn bind_to_regions(workers: &[&Worker], sub_areas: &[Vec<GeoPoint>]) -> Vec<String> {
    let centers: Vec<Option<GeoPoint>> = sub_areas.iter().map(|a| centroid(a)).collect();

    let mut pairs: Vec<(u64, usize, &str)> = Vec::new();
    for (region_idx, center) in centers.iter().enumerate() {
        for worker in workers {
            if let (Some(center), Some(position)) = (center, &worker.position) {
                // Millimeter quantization keeps the sort total and
                // deterministic across platforms.
                let distance = (position.haversine_m(center) * 1000.0) as u64;
                pairs.push((distance, region_idx, worker.id.as_str()));
            }
        }
    }
    pairs.sort();

    let mut by_region: HashMap<usize, String> = HashMap::new();
    let mut taken: Vec<&str> = Vec::new();
    for (_, region_idx, worker_id) in pairs {
        if by_region.contains_key(&region_idx) || taken.contains(&worker_id) {
            continue;
        }
        by_region.insert(region_idx, worker_id.to_string());
        taken.push(worker_id);
    }

    // Unpositioned workers (or leftovers) take the remaining regions.
    let mut rest: Vec<&str> = workers
        .iter()
        .map(|w| w.id.as_str())
        .filter(|id| !taken.contains(id))
        .collect();
    rest.sort();
    let mut rest = rest.into_iter();
    (0..sub_areas.len())
        .map(|idx| {
            by_region
                .remove(&idx)
                .or_else(|| rest.next().map(str::to_string))
                .unwrap_or_default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::NoLoadPrediction;
    use fleet_model::MissionPayload;
    use std::collections::HashMap as Map;

    fn worker(id: &str, battery: f64, caps: &[(&str, f64)]) -> Worker {
        let mut capabilities: Map<String, f64> =
            caps.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        capabilities.insert("battery".into(), battery);
        let mut w = Worker::register(id.to_string(), capabilities, 0);
        w.battery_pct = battery;
        w
    }

    fn at(mut w: Worker, lat: f64, lon: f64) -> Worker {
        w.position = Some(GeoPoint::new(lat, lon, 30.0));
        w
    }

    fn single_mission(params: &[(&str, &str)]) -> Mission {
        let payload = MissionPayload {
            task: "survey".into(),
            params: params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            area: vec![
                GeoPoint::new(0.0, 0.0, 30.0),
                GeoPoint::new(0.0, 0.4, 30.0),
                GeoPoint::new(0.2, 0.4, 30.0),
                GeoPoint::new(0.2, 0.0, 30.0),
            ],
            waypoints: Vec::new(),
        };
        Mission::new("m1".into(), MissionKind::SingleWorker, payload, 5, 1, 100)
    }

    #[test]
    fn picks_highest_battery() {
        let mission = single_mission(&[]);
        let candidates =
            vec![worker("w1", 40.0, &[]), worker("w2", 95.0, &[]), worker("w3", 70.0, &[])];
        let assignment = assign(&mission, &candidates, &NoLoadPrediction).unwrap();
        assert_eq!(assignment.workers, vec!["w2"]);
    }

    #[test]
    fn ties_break_on_worker_id() {
        let mission = single_mission(&[]);
        let candidates = vec![worker("w2", 80.0, &[]), worker("w1", 80.0, &[])];
        let assignment = assign(&mission, &candidates, &NoLoadPrediction).unwrap();
        assert_eq!(assignment.workers, vec!["w1"]);
    }

    #[test]
    fn capability_match_offsets_battery() {
        let mission = single_mission(&[("required_alt", "100"), ("required_payload", "camera")]);
        // w1: more battery, no headroom, no camera. w2: less battery but
        // full capability match.
        let candidates = vec![
            worker("w1", 95.0, &[("max_alt", 100.0)]),
            worker("w2", 75.0, &[("max_alt", 200.0), ("camera", 1.0)]),
        ];
        let assignment = assign(&mission, &candidates, &NoLoadPrediction).unwrap();
        assert_eq!(assignment.workers, vec!["w2"]);
    }

    #[test]
    fn advisor_reshapes_but_cannot_unfilter() {
        struct HateW2;
        impl LoadPredictor for HateW2 {
            fn predicted_load(&self, worker: &Worker) -> f64 {
                if worker.id == "w2" {
                    1.0
                } else {
                    0.0
                }
            }
        }
        let mission = single_mission(&[]);
        let candidates = vec![worker("w1", 85.0, &[]), worker("w2", 95.0, &[])];
        let assignment = assign(&mission, &candidates, &HateW2).unwrap();
        assert_eq!(assignment.workers, vec!["w1"]);

        // An advisor preferring an infeasible candidate cannot resurrect
        // it: an empty candidate set is already infeasible.
        let none: Vec<Worker> = Vec::new();
        assert!(matches!(
            assign(&mission, &none, &HateW2),
            Err(FleetError::NoFeasibleAssignment)
        ));
    }

    #[test]
    fn distance_constraint_excludes_far_and_unpositioned() {
        let mission = {
            let mut m = single_mission(&[("max_distance_m", "50000")]);
            m.payload.params.insert("max_distance_m".into(), "50000".into());
            m
        };
        let near = at(worker("near", 50.0, &[]), 0.1, 0.2);
        let far = at(worker("far", 99.0, &[]), 5.0, 5.0);
        let unknown = worker("unknown", 99.0, &[]);

        let assignment =
            assign(&mission, &[near, far, unknown], &NoLoadPrediction).unwrap();
        assert_eq!(assignment.workers, vec!["near"]);
    }

    #[test]
    fn multi_worker_split_is_a_bijection() {
        let mut mission = single_mission(&[]);
        mission.kind = MissionKind::MultiWorker;
        mission.payload.params.insert("worker_count".into(), "3".into());

        let candidates = vec![
            at(worker("w-east", 80.0, &[]), 0.1, 0.38),
            at(worker("w-west", 80.0, &[]), 0.1, 0.02),
            at(worker("w-mid", 80.0, &[]), 0.1, 0.2),
        ];
        let assignment = assign(&mission, &candidates, &NoLoadPrediction).unwrap();

        assert_eq!(assignment.workers.len(), 3);
        assert_eq!(assignment.sub_areas.len(), 3);
        // Every worker appears exactly once.
        let mut unique = assignment.workers.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 3);
        // Nearest-region binding: west worker gets the westmost slab.
        assert_eq!(assignment.workers[0], "w-west");
        assert_eq!(assignment.workers[1], "w-mid");
        assert_eq!(assignment.workers[2], "w-east");
    }

    #[test]
    fn multi_worker_without_enough_candidates_is_infeasible() {
        let mut mission = single_mission(&[]);
        mission.kind = MissionKind::MultiWorker;
        mission.payload.params.insert("worker_count".into(), "3".into());
        let candidates = vec![worker("w1", 80.0, &[]), worker("w2", 80.0, &[])];
        assert!(matches!(
            assign(&mission, &candidates, &NoLoadPrediction),
            Err(FleetError::NoFeasibleAssignment)
        ));
    }

    #[test]
    fn split_area_covers_bounding_box() {
        let area = vec![
            GeoPoint::new(0.0, 0.0, 30.0),
            GeoPoint::new(0.0, 0.9, 30.0),
            GeoPoint::new(0.3, 0.9, 30.0),
            GeoPoint::new(0.3, 0.0, 30.0),
        ];
        let slabs = split_area(&area, 3);
        assert_eq!(slabs.len(), 3);
        assert!((slabs[0][0].lon - 0.0).abs() < 1e-9);
        assert!((slabs[2][1].lon - 0.9).abs() < 1e-9);
        // Slabs share edges.
        assert!((slabs[0][1].lon - slabs[1][0].lon).abs() < 1e-9);
    }
}
