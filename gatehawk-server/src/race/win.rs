use super::WinCheckArgs;
use super::state::{CurrentRace, RaceStatus, StartBehavior, WinCondition, WinStatus};
use crate::results::leaderboard::Leaderboard;

/// How long the controller waits before forcing a decision that is still
/// waiting on an in-progress crossing.
const PENDING_CROSSING_WAIT_MS: i64 = 5_000;

#[derive(Debug, Clone)]
pub struct WinnerInfo {
    pub pilot_id: i64,
    pub callsign: String,
    /// Set in team racing mode; `callsign` then carries the team name too.
    pub team: Option<String>,
    pub node: usize,
}

#[derive(Debug, Clone)]
pub struct WinDecision {
    pub status: WinStatus,
    pub winner: Option<WinnerInfo>,
    /// When set, the decision may still be overturned: the controller
    /// sleeps this off and re-checks with `forced`.
    pub max_consideration_ms: Option<i64>,
}

impl WinDecision {
    fn none() -> Self {
        Self {
            status: WinStatus::None,
            winner: None,
            max_consideration_ms: None,
        }
    }
}

/// Evaluate the win condition against the current race. `crossing` carries
/// each node's live crossing flag for pending-crossing detection.
pub fn evaluate(
    race: &CurrentRace,
    board: &Leaderboard,
    crossing: &[bool],
    args: WinCheckArgs,
) -> WinDecision {
    match race.format.win_condition {
        WinCondition::None => WinDecision::none(),
        WinCondition::MostLaps => most_laps(race, board, crossing, args),
        WinCondition::FirstToLapX => first_to_lap_x(race),
        WinCondition::FastestLap => {
            fastest_by(race, board, crossing, args, |row| row.fastest_lap_ms)
        }
        WinCondition::FastestConsecutive => {
            fastest_by(race, board, crossing, args, |row| row.consecutives_ms)
        }
    }
}

/// Evaluation waits for the countdown to expire (or a stop / forced
/// re-check); overtime keeps checking every lap.
fn finish_reached(race: &CurrentRace, args: WinCheckArgs) -> bool {
    args.at_finish
        || args.forced
        || args.deleted_lap
        || race.race_status == RaceStatus::Done
        || race.win_status == WinStatus::Overtime
}

fn most_laps(
    race: &CurrentRace,
    board: &Leaderboard,
    crossing: &[bool],
    args: WinCheckArgs,
) -> WinDecision {
    if !finish_reached(race, args) {
        return WinDecision::none();
    }

    let rows = &board.rows;
    let Some(leader) = rows.first() else {
        return WinDecision::none();
    };
    if leader.laps == 0 {
        return WinDecision::none();
    }

    if let Some(runner_up) = rows.get(1) {
        if runner_up.laps == leader.laps && runner_up.total_time_ms == leader.total_time_ms {
            // Overtime is available whenever a grace window exists.
            let overtime_allowed = race.format.lap_grace_sec != 0;
            return WinDecision {
                status: if overtime_allowed && !args.forced {
                    WinStatus::Overtime
                } else {
                    WinStatus::Tie
                },
                winner: None,
                max_consideration_ms: None,
            };
        }
    }

    // A node mid-crossing that could still match the leader defers the call.
    if !args.forced {
        let contender_crossing = rows.iter().any(|row| {
            crossing.get(row.node_index).copied().unwrap_or(false) && row.laps + 1 >= leader.laps
                && row.pilot_id != leader.pilot_id
        });
        if contender_crossing {
            return WinDecision {
                status: WinStatus::PendingCrossing,
                winner: None,
                max_consideration_ms: Some(PENDING_CROSSING_WAIT_MS),
            };
        }
    }

    WinDecision {
        status: WinStatus::Declared,
        winner: Some(WinnerInfo {
            pilot_id: leader.pilot_id,
            callsign: leader.callsign.clone(),
            team: None,
            node: leader.node_index,
        }),
        max_consideration_ms: None,
    }
}

/// Timestamp at which a node completed its `n`th counted lap.
fn lap_n_stamp(race: &CurrentRace, node: usize, n: i64) -> Option<i64> {
    let active = race.active_laps(node, false);
    let index = match race.format.start_behavior {
        StartBehavior::HoleShot => n as usize,
        _ => (n as usize).checked_sub(1)?,
    };
    active.get(index).map(|lap| lap.lap_time_stamp)
}

fn first_to_lap_x(race: &CurrentRace) -> WinDecision {
    let target = race.format.number_laps_win;
    if target <= 0 {
        return WinDecision::none();
    }

    if race.format.team_racing_mode {
        return first_team_to_lap_x(race, target);
    }

    let mut best: Option<(i64, usize)> = None;
    for node in 0..race.node_count() {
        if (race.completed_laps(node) as i64) < target {
            continue;
        }
        let Some(stamp) = lap_n_stamp(race, node, target) else {
            continue;
        };
        // Earliest to reach the target; ties go to the lowest node index.
        let better = match best {
            None => true,
            Some((best_stamp, best_node)) => {
                stamp < best_stamp || (stamp == best_stamp && node < best_node)
            }
        };
        if better {
            best = Some((stamp, node));
        }
    }

    match best {
        Some((_, node)) => WinDecision {
            status: WinStatus::Declared,
            winner: Some(WinnerInfo {
                pilot_id: race.node_pilots[node],
                callsign: race.node_callsigns[node].clone(),
                team: None,
                node,
            }),
            max_consideration_ms: None,
        },
        None => WinDecision::none(),
    }
}

fn first_team_to_lap_x(race: &CurrentRace, target: i64) -> WinDecision {
    // Every counted lap as (stamp, team, node), in time order.
    let mut laps: Vec<(i64, String, usize)> = Vec::new();
    for node in 0..race.node_count() {
        let Some(team) = race.node_teams[node].clone() else {
            continue;
        };
        let active = race.active_laps(node, false);
        let skip = match race.format.start_behavior {
            StartBehavior::HoleShot => 1,
            _ => 0,
        };
        for lap in active.into_iter().skip(skip) {
            laps.push((lap.lap_time_stamp, team.clone(), node));
        }
    }
    laps.sort_by_key(|(stamp, _, node)| (*stamp, *node));

    let mut totals: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
    for (_, team, node) in &laps {
        let count = totals.entry(team.clone()).or_insert(0);
        *count += 1;
        if *count >= target {
            return WinDecision {
                status: WinStatus::Declared,
                winner: Some(WinnerInfo {
                    pilot_id: race.node_pilots[*node],
                    callsign: team.clone(),
                    team: Some(team.clone()),
                    node: *node,
                }),
                max_consideration_ms: None,
            };
        }
    }
    WinDecision::none()
}

fn fastest_by(
    race: &CurrentRace,
    board: &Leaderboard,
    crossing: &[bool],
    args: WinCheckArgs,
    metric: impl Fn(&crate::results::leaderboard::LeaderboardRow) -> Option<i64>,
) -> WinDecision {
    if !finish_reached(race, args) {
        return WinDecision::none();
    }

    let mut candidates: Vec<&crate::results::leaderboard::LeaderboardRow> = board
        .rows
        .iter()
        .filter(|row| metric(row).is_some())
        .collect();
    candidates.sort_by_key(|row| {
        (
            metric(row).unwrap_or(i64::MAX),
            row.node_index,
            row.pilot_id,
        )
    });
    let Some(best) = candidates.first() else {
        return WinDecision::none();
    };

    // Late laps still inside the grace window may overturn the decision.
    if !args.forced {
        let any_crossing = crossing.iter().any(|&flag| flag);
        if any_crossing {
            return WinDecision {
                status: WinStatus::PendingCrossing,
                winner: None,
                max_consideration_ms: Some(PENDING_CROSSING_WAIT_MS),
            };
        }
        if race.race_status == RaceStatus::Racing && race.format.lap_grace_sec > 0 {
            return WinDecision {
                status: WinStatus::PendingCrossing,
                winner: None,
                max_consideration_ms: Some(race.format.lap_grace_sec * 1000),
            };
        }
    }

    WinDecision {
        status: WinStatus::Declared,
        winner: Some(WinnerInfo {
            pilot_id: best.pilot_id,
            callsign: best.callsign.clone(),
            team: None,
            node: best.node_index,
        }),
        max_consideration_ms: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ProfileRow;
    use crate::race::state::{Lap, LapSource, RaceFormat, RaceMode};
    use crate::results::leaderboard::{self, RankMethod};

    fn profile() -> ProfileRow {
        ProfileRow {
            id: 1,
            name: "Default".into(),
            description: String::new(),
            frequencies: r#"{"b":[],"c":[],"f":[]}"#.into(),
            enter_ats: None,
            exit_ats: None,
        }
    }

    fn race_with(format: RaceFormat, nodes: usize) -> CurrentRace {
        let mut race = CurrentRace::new(nodes, format, profile());
        race.current_heat = 1;
        for node in 0..nodes {
            race.node_pilots[node] = node as i64 + 1;
            race.node_callsigns[node] = format!("pilot{}", node + 1);
        }
        race
    }

    fn push_laps(race: &mut CurrentRace, node: usize, stamps: &[i64]) {
        let mut prev = 0;
        for &stamp in stamps {
            let lap_number = race.node_laps[node].len() as i64;
            race.node_laps[node].push(Lap {
                lap_number: Some(lap_number),
                lap_time_stamp: stamp,
                lap_time: stamp - prev,
                source: LapSource::Rf,
                deleted: false,
                invalid: false,
                late_lap: false,
            });
            prev = stamp;
        }
    }

    fn board_for(race: &CurrentRace, ranking: RankMethod) -> Leaderboard {
        leaderboard::compute(race.pilot_laps(), ranking)
    }

    fn most_laps_format() -> RaceFormat {
        let mut format = RaceFormat::secondary();
        format.id = 1;
        format.name = "Most Laps".into();
        format.race_mode = RaceMode::CountDown;
        format.race_time_sec = 120;
        format.lap_grace_sec = 5;
        format.win_condition = WinCondition::MostLaps;
        format
    }

    #[test]
    fn most_laps_waits_for_finish() {
        let mut race = race_with(most_laps_format(), 2);
        push_laps(&mut race, 0, &[2_000, 12_000]);
        let board = board_for(&race, RankMethod::RaceProgress);

        let decision = evaluate(&race, &board, &[false, false], WinCheckArgs::default());
        assert_eq!(decision.status, WinStatus::None);

        let decision = evaluate(
            &race,
            &board,
            &[false, false],
            WinCheckArgs {
                at_finish: true,
                ..Default::default()
            },
        );
        assert_eq!(decision.status, WinStatus::Declared);
        assert_eq!(decision.winner.unwrap().pilot_id, 1);
    }

    #[test]
    fn most_laps_tie_goes_to_overtime_when_grace_allows() {
        let mut race = race_with(most_laps_format(), 2);
        push_laps(&mut race, 0, &[2_000, 12_000]);
        push_laps(&mut race, 1, &[2_000, 12_000]);
        let board = board_for(&race, RankMethod::RaceProgress);

        let decision = evaluate(
            &race,
            &board,
            &[false, false],
            WinCheckArgs {
                at_finish: true,
                ..Default::default()
            },
        );
        assert_eq!(decision.status, WinStatus::Overtime);

        // Forced decision (consideration expired) settles on a tie.
        let decision = evaluate(
            &race,
            &board,
            &[false, false],
            WinCheckArgs {
                at_finish: true,
                forced: true,
                ..Default::default()
            },
        );
        assert_eq!(decision.status, WinStatus::Tie);
    }

    #[test]
    fn most_laps_defers_while_contender_is_crossing() {
        let mut race = race_with(most_laps_format(), 2);
        push_laps(&mut race, 0, &[2_000, 12_000, 24_000]);
        push_laps(&mut race, 1, &[2_500, 13_000]);
        let board = board_for(&race, RankMethod::RaceProgress);

        let decision = evaluate(
            &race,
            &board,
            &[false, true],
            WinCheckArgs {
                at_finish: true,
                ..Default::default()
            },
        );
        assert_eq!(decision.status, WinStatus::PendingCrossing);
        assert!(decision.max_consideration_ms.is_some());
    }

    fn first_to_3_format() -> RaceFormat {
        let mut format = RaceFormat::secondary();
        format.id = 2;
        format.name = "First to 3".into();
        format.race_mode = RaceMode::NoTimeLimit;
        format.number_laps_win = 3;
        format.win_condition = WinCondition::FirstToLapX;
        format
    }

    #[test]
    fn first_to_lap_x_declares_earliest_finisher() {
        let mut race = race_with(first_to_3_format(), 2);
        // Node 0 reaches lap 3 at 30s, node 1 at 31s.
        push_laps(&mut race, 0, &[2_000, 11_000, 21_000, 30_000]);
        push_laps(&mut race, 1, &[2_500, 12_000, 22_000, 31_000]);
        let board = board_for(&race, RankMethod::RaceProgress);

        let decision = evaluate(&race, &board, &[false, false], WinCheckArgs::default());
        assert_eq!(decision.status, WinStatus::Declared);
        assert_eq!(decision.winner.unwrap().node, 0);
    }

    #[test]
    fn first_to_lap_x_needs_target_reached() {
        let mut race = race_with(first_to_3_format(), 2);
        push_laps(&mut race, 0, &[2_000, 11_000, 21_000]);
        let board = board_for(&race, RankMethod::RaceProgress);

        let decision = evaluate(&race, &board, &[false, false], WinCheckArgs::default());
        assert_eq!(decision.status, WinStatus::None);
    }

    #[test]
    fn team_mode_first_to_x_counts_team_total() {
        let mut format = first_to_3_format();
        format.team_racing_mode = true;
        let mut race = race_with(format, 3);
        race.node_teams[0] = Some("A".into());
        race.node_teams[1] = Some("A".into());
        race.node_teams[2] = Some("B".into());

        // Team A: laps at 11s (n0), 12s (n1), 20s (n0) → 3 laps at 20s.
        push_laps(&mut race, 0, &[2_000, 11_000, 20_000]);
        push_laps(&mut race, 1, &[2_500, 12_000]);
        // Team B: 2 laps.
        push_laps(&mut race, 2, &[2_200, 10_000, 19_000]);

        let board = board_for(&race, RankMethod::RaceProgress);
        let decision = evaluate(&race, &board, &[false; 3], WinCheckArgs::default());
        assert_eq!(decision.status, WinStatus::Declared);
        assert_eq!(decision.winner.unwrap().team.as_deref(), Some("A"));
    }

    #[test]
    fn fastest_lap_holds_decision_during_grace() {
        let mut format = most_laps_format();
        format.win_condition = WinCondition::FastestLap;
        let mut race = race_with(format, 2);
        race.race_status = RaceStatus::Racing;
        push_laps(&mut race, 0, &[2_000, 12_000]);
        push_laps(&mut race, 1, &[2_500, 11_500]);
        let board = board_for(&race, RankMethod::FastestLap);

        let decision = evaluate(
            &race,
            &board,
            &[false, false],
            WinCheckArgs {
                at_finish: true,
                ..Default::default()
            },
        );
        assert_eq!(decision.status, WinStatus::PendingCrossing);
        assert_eq!(decision.max_consideration_ms, Some(5_000));

        let decision = evaluate(
            &race,
            &board,
            &[false, false],
            WinCheckArgs {
                at_finish: true,
                forced: true,
                ..Default::default()
            },
        );
        assert_eq!(decision.status, WinStatus::Declared);
        // Node 1's 9.0s lap beats node 0's 10.0s lap.
        assert_eq!(decision.winner.unwrap().node, 1);
    }
}
