pub mod database;
pub mod entities;
pub mod freq;
pub mod race;
pub mod system;

use gatehawk_contracts::{ClientCommand, ServerPush};

use crate::api::state::AppState;
use crate::db::store::StoreResult;

/// Dispatch one client command. The returned pushes go only to the
/// requesting session; broadcasts happen inside the handlers through the
/// UI channel.
pub async fn dispatch(state: &AppState, command: ClientCommand) -> StoreResult<Vec<ServerPush>> {
    match command {
        ClientCommand::LoadData { types } => system::load_data(state, &types).await,
        ClientCommand::GetPiTime => Ok(vec![ServerPush::PiTime {
            pi_time_s: state.services.clock.now(),
        }]),
        ClientCommand::ShutdownPi => system::shutdown(state, "shutdown").await,
        ClientCommand::RebootPi => system::shutdown(state, "reboot").await,
        ClientCommand::KillServer => system::shutdown(state, "kill").await,
        ClientCommand::RetrySecondary { secondary_id } => {
            system::retry_secondary(state, secondary_id)
        }
        ClientCommand::SetOption { option, value } => {
            state.services.store.set_option(&option, &value).await?;
            Ok(vec![])
        }

        ClientCommand::StageRace => race::stage(state).await,
        ClientCommand::StopRace => race::stop(state, false).await,
        ClientCommand::SaveLaps => race::save(state).await,
        ClientCommand::DiscardLaps => race::discard(state).await,
        ClientCommand::SetCurrentHeat { heat } => race::set_current_heat(state, heat).await,
        ClientCommand::ScheduleRace { m, s } => race::schedule(state, m, s).await,
        ClientCommand::CancelScheduleRace => race::cancel_schedule(state).await,
        ClientCommand::SetRaceFormat { race_format } => {
            race::set_race_format(state, race_format).await
        }
        ClientCommand::SetProfile { profile } => race::set_profile(state, profile).await,
        ClientCommand::DeleteLap { node, lap_index } => {
            race::delete_lap(state, node, lap_index).await
        }
        ClientCommand::RestoreDeletedLap { node, lap_index } => {
            race::restore_deleted_lap(state, node, lap_index).await
        }
        ClientCommand::AlterRace { race_id, heat_id } => {
            race::reassign(state, race_id, heat_id).await
        }

        ClientCommand::SetFrequency {
            node,
            band,
            channel,
            frequency,
        } => freq::set_frequency(state, node, band, channel, frequency).await,
        ClientCommand::SetFrequencyPreset { preset } => {
            freq::set_frequency_preset(state, &preset).await
        }
        ClientCommand::SetEnterAtLevel {
            node,
            enter_at_level,
        } => freq::set_enter_at_level(state, node, enter_at_level as i64).await,
        ClientCommand::SetExitAtLevel {
            node,
            exit_at_level,
        } => freq::set_exit_at_level(state, node, exit_at_level as i64).await,
        ClientCommand::CapEnterAtBtn { node } => {
            state.services.nodes.start_capture_enter_at_level(node);
            Ok(vec![])
        }
        ClientCommand::CapExitAtBtn { node } => {
            state.services.nodes.start_capture_exit_at_level(node);
            Ok(vec![])
        }
        ClientCommand::SetMinLap { min_lap } => freq::set_min_lap(state, min_lap).await,
        ClientCommand::SetMinLapBehavior { min_lap_behavior } => {
            freq::set_min_lap_behavior(state, min_lap_behavior).await
        }

        ClientCommand::AddPilot => entities::add_pilot(state).await,
        ClientCommand::AlterPilot(patch) => entities::alter_pilot(state, patch).await,
        ClientCommand::DeletePilot { pilot } => entities::delete_pilot(state, pilot).await,
        ClientCommand::AddHeat => entities::add_heat(state).await,
        ClientCommand::DuplicateHeat { heat } => entities::duplicate_heat(state, heat).await,
        ClientCommand::AlterHeat(patch) => entities::alter_heat(state, patch).await,
        ClientCommand::DeleteHeat { heat } => entities::delete_heat(state, heat).await,
        ClientCommand::AddRaceClass => entities::add_class(state).await,
        ClientCommand::DuplicateRaceClass { class } => {
            entities::duplicate_class(state, class).await
        }
        ClientCommand::AlterRaceClass(patch) => entities::alter_class(state, patch).await,
        ClientCommand::DeleteClass { class } => entities::delete_class(state, class).await,
        ClientCommand::AddRaceFormat { source_format_id } => {
            entities::add_format(state, source_format_id).await
        }
        ClientCommand::AlterRaceFormat(patch) => entities::alter_format(state, patch).await,
        ClientCommand::DeleteRaceFormat { format_id } => {
            entities::delete_format(state, format_id).await
        }
        ClientCommand::AddProfile { source_profile_id } => {
            entities::add_profile(state, source_profile_id).await
        }
        ClientCommand::AlterProfile(patch) => entities::alter_profile(state, patch).await,
        ClientCommand::DeleteProfile => entities::delete_profile(state).await,

        ClientCommand::BackupDatabase => database::backup(state).await,
        ClientCommand::ListBackups => database::list_backups(state),
        ClientCommand::RestoreDatabase { backup_file } => {
            database::restore(state, &backup_file).await
        }
        ClientCommand::DeleteDatabaseFile { backup_file } => {
            database::delete_backup(state, &backup_file)
        }
        ClientCommand::ResetDatabase { reset_type } => database::reset(state, &reset_type).await,
        ClientCommand::ExportDatabase { exporter } => database::export(state, &exporter).await,
        ClientCommand::GenerateHeatsV2 {
            generator,
            input_class,
            output_class,
        } => database::generate_heats(state, &generator, input_class, output_class).await,

        ClientCommand::SetLedEventEffect { event, effect } => {
            system::set_led_event_effect(state, &event, &effect).await
        }
        ClientCommand::UseLedEffect { effect } => system::use_led_effect(state, &effect),
        ClientCommand::LedBrightnessSet { brightness } => {
            system::set_led_brightness(state, brightness).await
        }
    }
}
