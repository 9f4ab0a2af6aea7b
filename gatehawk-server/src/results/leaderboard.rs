use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One accepted lap: the stamp is milliseconds from race start, the time is
/// the duration of this lap. Lap 0 is the hole-shot from the launch pad to
/// the first gate pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LapTime {
    pub lap_time_stamp: i64,
    pub lap_time: i64,
}

/// Lap history of one pilot feeding a leaderboard build.
#[derive(Debug, Clone)]
pub struct PilotLaps {
    pub pilot_id: i64,
    pub callsign: String,
    pub team: String,
    pub node_index: usize,
    /// Active (non-deleted) laps in time order, hole shot first.
    pub laps: Vec<LapTime>,
}

/// Primary ranking applied to the rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RankMethod {
    /// Laps descending, total time ascending.
    RaceProgress,
    /// Best single lap ascending.
    FastestLap,
    /// Best three consecutive laps ascending.
    FastestConsecutive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardRow {
    pub pilot_id: i64,
    pub callsign: String,
    pub team: String,
    pub node_index: usize,
    /// Completed laps, the hole shot excluded.
    pub laps: u32,
    /// Milliseconds from race start to the last accepted pass.
    pub total_time_ms: i64,
    pub last_lap_ms: Option<i64>,
    pub average_lap_ms: Option<i64>,
    pub fastest_lap_ms: Option<i64>,
    /// Best sum of three consecutive laps.
    pub consecutives_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leaderboard {
    pub ranking: RankMethod,
    /// Rows sorted by the primary ranking.
    pub rows: Vec<LeaderboardRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamStanding {
    pub team: String,
    pub laps: u32,
    pub total_time_ms: i64,
}

pub fn compute(inputs: Vec<PilotLaps>, ranking: RankMethod) -> Leaderboard {
    let mut rows: Vec<LeaderboardRow> = inputs.into_iter().map(row_for_pilot).collect();
    sort_rows(&mut rows, ranking);
    Leaderboard { ranking, rows }
}

fn row_for_pilot(input: PilotLaps) -> LeaderboardRow {
    // Lap 0 is the hole shot; completed laps start at index 1.
    let counted: Vec<i64> = input.laps.iter().skip(1).map(|l| l.lap_time).collect();
    let laps = counted.len() as u32;
    let total_time_ms = input.laps.last().map(|l| l.lap_time_stamp).unwrap_or(0);
    let last_lap_ms = counted.last().copied();
    let fastest_lap_ms = counted.iter().copied().min();
    let average_lap_ms = if counted.is_empty() {
        None
    } else {
        Some(counted.iter().sum::<i64>() / counted.len() as i64)
    };
    let consecutives_ms = counted
        .windows(3)
        .map(|w| w.iter().sum::<i64>())
        .min();

    LeaderboardRow {
        pilot_id: input.pilot_id,
        callsign: input.callsign,
        team: input.team,
        node_index: input.node_index,
        laps,
        total_time_ms,
        last_lap_ms,
        average_lap_ms,
        fastest_lap_ms,
        consecutives_ms,
    }
}

pub fn sort_rows(rows: &mut [LeaderboardRow], ranking: RankMethod) {
    match ranking {
        RankMethod::RaceProgress => rows.sort_by(progress_order),
        RankMethod::FastestLap => rows.sort_by(|a, b| {
            option_asc(a.fastest_lap_ms, b.fastest_lap_ms).then_with(|| tie_break(a, b))
        }),
        RankMethod::FastestConsecutive => rows.sort_by(|a, b| {
            option_asc(a.consecutives_ms, b.consecutives_ms).then_with(|| tie_break(a, b))
        }),
    }
}

fn progress_order(a: &LeaderboardRow, b: &LeaderboardRow) -> Ordering {
    b.laps
        .cmp(&a.laps)
        .then_with(|| a.total_time_ms.cmp(&b.total_time_ms))
        .then_with(|| tie_break(a, b))
}

/// Lowest node index first, then lowest pilot id.
fn tie_break(a: &LeaderboardRow, b: &LeaderboardRow) -> Ordering {
    a.node_index
        .cmp(&b.node_index)
        .then_with(|| a.pilot_id.cmp(&b.pilot_id))
}

fn option_asc(a: Option<i64>, b: Option<i64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Lap totals per team, best total first.
pub fn team_standings(rows: &[LeaderboardRow]) -> Vec<TeamStanding> {
    let mut teams: BTreeMap<&str, (u32, i64)> = BTreeMap::new();
    for row in rows {
        let entry = teams.entry(row.team.as_str()).or_default();
        entry.0 += row.laps;
        entry.1 += row.total_time_ms;
    }

    let mut standings: Vec<TeamStanding> = teams
        .into_iter()
        .map(|(team, (laps, total_time_ms))| TeamStanding {
            team: team.to_string(),
            laps,
            total_time_ms,
        })
        .collect();
    standings.sort_by(|a, b| {
        b.laps
            .cmp(&a.laps)
            .then_with(|| a.total_time_ms.cmp(&b.total_time_ms))
    });
    standings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pilot(id: i64, node: usize, stamps: &[i64]) -> PilotLaps {
        let mut laps = Vec::new();
        let mut prev = 0;
        for &stamp in stamps {
            laps.push(LapTime {
                lap_time_stamp: stamp,
                lap_time: stamp - prev,
            });
            prev = stamp;
        }
        PilotLaps {
            pilot_id: id,
            callsign: format!("pilot{id}"),
            team: if id % 2 == 0 { "A".into() } else { "B".into() },
            node_index: node,
            laps,
        }
    }

    #[test]
    fn hole_shot_is_not_a_completed_lap() {
        let board = compute(
            vec![pilot(1, 0, &[2_000, 12_000, 22_000])],
            RankMethod::RaceProgress,
        );
        let row = &board.rows[0];
        assert_eq!(row.laps, 2);
        assert_eq!(row.total_time_ms, 22_000);
        assert_eq!(row.fastest_lap_ms, Some(10_000));
        assert_eq!(row.average_lap_ms, Some(10_000));
    }

    #[test]
    fn progress_ranking_orders_by_laps_then_time() {
        let board = compute(
            vec![
                pilot(1, 0, &[2_000, 12_000]),          // 1 lap
                pilot(2, 1, &[2_500, 11_000, 21_000]),  // 2 laps, 21s
                pilot(3, 2, &[2_000, 11_500, 20_500]),  // 2 laps, 20.5s
            ],
            RankMethod::RaceProgress,
        );
        let order: Vec<i64> = board.rows.iter().map(|r| r.pilot_id).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn ties_break_by_node_then_pilot_id() {
        let board = compute(
            vec![
                pilot(9, 3, &[1_000, 11_000]),
                pilot(4, 1, &[1_000, 11_000]),
            ],
            RankMethod::RaceProgress,
        );
        assert_eq!(board.rows[0].pilot_id, 4);
    }

    #[test]
    fn consecutives_take_best_three_lap_window() {
        // Lap times after hole shot: 10, 12, 9, 8 → best window 12+9+8 = 29
        let board = compute(
            vec![pilot(1, 0, &[2_000, 12_000, 24_000, 33_000, 41_000])],
            RankMethod::FastestConsecutive,
        );
        assert_eq!(board.rows[0].consecutives_ms, Some(29_000));
    }

    #[test]
    fn fastest_lap_ranking_places_lapless_pilots_last() {
        let board = compute(
            vec![pilot(1, 0, &[2_000]), pilot(2, 1, &[2_000, 10_000])],
            RankMethod::FastestLap,
        );
        assert_eq!(board.rows[0].pilot_id, 2);
        assert_eq!(board.rows[1].fastest_lap_ms, None);
    }

    #[test]
    fn team_standings_sum_laps() {
        let board = compute(
            vec![
                pilot(2, 0, &[1_000, 11_000, 21_000]),
                pilot(4, 1, &[1_000, 12_000]),
                pilot(1, 2, &[1_000, 13_000]),
            ],
            RankMethod::RaceProgress,
        );
        let teams = team_standings(&board.rows);
        assert_eq!(teams[0].team, "A");
        assert_eq!(teams[0].laps, 3);
        assert_eq!(teams[1].team, "B");
        assert_eq!(teams[1].laps, 1);
    }
}
