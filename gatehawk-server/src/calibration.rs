use std::sync::Arc;

use tracing::{debug, info};

use crate::Services;
use crate::db::store::{ID_NONE, PilotRaceQuery};
use crate::race::state::CurrentRace;

/// Best enter/exit levels discovered for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    pub enter_at_level: i64,
    pub exit_at_level: i64,
}

/// Apply the best discovered tuning values to every node of the current
/// heat. Skipped entirely in practice mode.
pub async fn auto_update_calibration(services: &Arc<Services>, race: &CurrentRace) {
    if race.current_heat == ID_NONE {
        debug!("Skipping auto calibration; server in practice mode");
        return;
    }

    let class_id = match services.store.get_heat(race.current_heat).await {
        Ok(Some(heat)) => heat.class_id,
        _ => ID_NONE,
    };

    for state in services.nodes.snapshot() {
        let node = state.index;
        let pilot_id = race.node_pilots.get(node).copied().unwrap_or(ID_NONE);
        let current = Calibration {
            enter_at_level: state.enter_at_level,
            exit_at_level: state.exit_at_level,
        };

        let calibration = find_best_values(
            services,
            node as i64,
            pilot_id,
            race.current_heat,
            class_id,
            state.frequency,
            current,
        )
        .await;

        if calibration.enter_at_level != state.enter_at_level {
            services
                .nodes
                .set_enter_at_level(node, calibration.enter_at_level);
        }
        if calibration.exit_at_level != state.exit_at_level {
            services
                .nodes
                .set_exit_at_level(node, calibration.exit_at_level);
        }
    }

    info!("Updated calibration with best discovered values");
}

/// Search race history for the best tuning values, most specific match
/// first: same heat+node, then same class+pilot+node, same pilot+node,
/// same node, else keep the current thresholds.
pub async fn find_best_values(
    services: &Arc<Services>,
    node_index: i64,
    pilot_id: i64,
    heat_id: i64,
    class_id: i64,
    frequency: u32,
    current: Calibration,
) -> Calibration {
    if pilot_id == ID_NONE || frequency == 0 {
        debug!(node = node_index + 1, "Calibration: skipping disabled node");
        return current;
    }

    let store = &services.store;

    if let Ok(Some((enter, exit))) = store
        .latest_saved_levels(PilotRaceQuery {
            node_index,
            heat_id: Some(heat_id),
            ..Default::default()
        })
        .await
    {
        debug!(node = node_index + 1, "Calibration: same heat, same node");
        return Calibration {
            enter_at_level: enter,
            exit_at_level: exit,
        };
    }

    if class_id != ID_NONE {
        if let Ok(Some((enter, exit))) = store
            .latest_saved_levels(PilotRaceQuery {
                node_index,
                pilot_id: Some(pilot_id),
                class_id: Some(class_id),
                ..Default::default()
            })
            .await
        {
            debug!(node = node_index + 1, "Calibration: same class, same pilot, same node");
            return Calibration {
                enter_at_level: enter,
                exit_at_level: exit,
            };
        }
    }

    if let Ok(Some((enter, exit))) = store
        .latest_saved_levels(PilotRaceQuery {
            node_index,
            pilot_id: Some(pilot_id),
            ..Default::default()
        })
        .await
    {
        debug!(node = node_index + 1, "Calibration: same pilot, same node");
        return Calibration {
            enter_at_level: enter,
            exit_at_level: exit,
        };
    }

    if let Ok(Some((enter, exit))) = store
        .latest_saved_levels(PilotRaceQuery {
            node_index,
            ..Default::default()
        })
        .await
    {
        debug!(node = node_index + 1, "Calibration: same node in other heat");
        return Calibration {
            enter_at_level: enter,
            exit_at_level: exit,
        };
    }

    debug!(node = node_index + 1, "Calibration: no hints found, no change");
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::{NewSavedPilotRace, NewSavedRace, Store};
    use crate::race::test_support::build_controller;

    async fn seed_race(
        store: &Store,
        heat_id: i64,
        class_id: i64,
        node: i64,
        pilot_id: i64,
        enter: i64,
    ) {
        let round = store.get_max_round(heat_id).await.unwrap() + 1;
        store
            .save_race(NewSavedRace {
                round_id: round,
                heat_id,
                class_id,
                format_id: ID_NONE,
                start_time: round as f64,
                start_time_wall: format!("2026-06-01 10:{round:02}:00"),
                pilot_races: vec![NewSavedPilotRace {
                    node_index: node,
                    pilot_id,
                    enter_at: enter,
                    exit_at: enter - 12,
                    rssi_history: "[]".into(),
                    time_history: "[]".into(),
                    laps: vec![],
                }],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn search_prefers_same_heat_then_widens() {
        let (race, _rx) = build_controller().await;
        let controller = race.lock().await;
        let services = controller.services.clone();
        let store = &services.store;

        let heat_a = store.list_heats().await.unwrap()[0].id;
        let heat_b = store.add_heat().await.unwrap().id;
        let pilot = store.add_pilot().await.unwrap().id;
        let other_pilot = store.add_pilot().await.unwrap().id;

        let current = Calibration {
            enter_at_level: 50,
            exit_at_level: 40,
        };

        // No history: keep current thresholds.
        let found = find_best_values(&services, 0, pilot, heat_a, ID_NONE, 5658, current).await;
        assert_eq!(found, current);

        // Same node, other pilot, other heat: weakest match.
        seed_race(store, heat_b, ID_NONE, 0, other_pilot, 70).await;
        let found = find_best_values(&services, 0, pilot, heat_a, ID_NONE, 5658, current).await;
        assert_eq!(found.enter_at_level, 70);

        // Same pilot on the node elsewhere beats the node-only match.
        seed_race(store, heat_b, ID_NONE, 0, pilot, 80).await;
        let found = find_best_values(&services, 0, pilot, heat_a, ID_NONE, 5658, current).await;
        assert_eq!(found.enter_at_level, 80);

        // Same heat wins over everything.
        seed_race(store, heat_a, ID_NONE, 0, other_pilot, 95).await;
        let found = find_best_values(&services, 0, pilot, heat_a, ID_NONE, 5658, current).await;
        assert_eq!(found.enter_at_level, 95);
    }

    #[tokio::test]
    async fn disabled_nodes_keep_current_values() {
        let (race, _rx) = build_controller().await;
        let controller = race.lock().await;
        let services = controller.services.clone();

        let current = Calibration {
            enter_at_level: 55,
            exit_at_level: 45,
        };
        let found = find_best_values(&services, 0, ID_NONE, 1, ID_NONE, 5658, current).await;
        assert_eq!(found, current);
        let found = find_best_values(&services, 0, 3, 1, ID_NONE, 0, current).await;
        assert_eq!(found, current);
    }
}
