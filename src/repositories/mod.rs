pub mod run_info;
pub mod run_result;

pub use run_info::RunInfoRepository;
pub use run_result::{
    RunResult, action_record_key, get_action_record, put_action_record, put_check_result,
    read_record,
};
