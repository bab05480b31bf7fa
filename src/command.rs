use crate::solarmax::QueryField;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Kind 200 write of `FIELD=value` items to one inverter.
    WriteSetting(u8, Vec<(QueryField, u64)>),
}

impl Command {
    pub fn to_result_topic(&self) -> String {
        use Command::*;

        let rest = match self {
            WriteSetting(inverter, _) => format!("{}/set", inverter),
        };

        format!("result/{}", rest)
    }
}
