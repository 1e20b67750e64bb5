mod adherence;
mod alerts;
mod checkin;
mod helpers;
mod summary;
mod user;

pub(crate) use adherence::cmd_adherence;
pub(crate) use alerts::cmd_alerts;
pub(crate) use checkin::cmd_checkin;
pub(crate) use summary::{cmd_summary_generate, cmd_summary_list};
pub(crate) use user::{cmd_link, cmd_user_add, cmd_user_list};
