//! Line-oriented ASCII codec for the storage protocol, pipe-delimited so it
//! survives text-based emulator queues. Message type and replica role travel
//! as integer codes, the sender as its dotted form.

use thiserror::Error;

use crate::network::NodeAddress;
use crate::storage::store::ReplicaRole;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageMessage {
    Create {
        trans_id: u64,
        from: NodeAddress,
        key: String,
        value: String,
        role: ReplicaRole,
    },
    Read {
        trans_id: u64,
        from: NodeAddress,
        key: String,
    },
    Update {
        trans_id: u64,
        from: NodeAddress,
        key: String,
        value: String,
        role: ReplicaRole,
    },
    Delete {
        trans_id: u64,
        from: NodeAddress,
        key: String,
    },
    Reply {
        trans_id: u64,
        from: NodeAddress,
        success: bool,
    },
    ReadReply {
        trans_id: u64,
        from: NodeAddress,
        /// Empty means "not found".
        value: String,
    },
}

const TYPE_CREATE: &str = "0";
const TYPE_READ: &str = "1";
const TYPE_UPDATE: &str = "2";
const TYPE_REPLY: &str = "3";
const TYPE_READREPLY: &str = "4";
const TYPE_DELETE: &str = "5";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("storage message is not valid utf-8")]
    NotUtf8,
    #[error("storage message is missing the {0} field")]
    MissingField(&'static str),
    #[error("storage message has an invalid {0} field")]
    InvalidField(&'static str),
    #[error("unknown storage message type {0:?}")]
    UnknownType(String),
}

pub type Result<T> = std::result::Result<T, WireError>;

impl StorageMessage {
    pub fn trans_id(&self) -> u64 {
        match self {
            StorageMessage::Create { trans_id, .. }
            | StorageMessage::Read { trans_id, .. }
            | StorageMessage::Update { trans_id, .. }
            | StorageMessage::Delete { trans_id, .. }
            | StorageMessage::Reply { trans_id, .. }
            | StorageMessage::ReadReply { trans_id, .. } => *trans_id,
        }
    }

    pub fn from(&self) -> NodeAddress {
        match self {
            StorageMessage::Create { from, .. }
            | StorageMessage::Read { from, .. }
            | StorageMessage::Update { from, .. }
            | StorageMessage::Delete { from, .. }
            | StorageMessage::Reply { from, .. }
            | StorageMessage::ReadReply { from, .. } => *from,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let line = match self {
            StorageMessage::Create {
                trans_id,
                from,
                key,
                value,
                role,
            } => format!(
                "{trans_id}|{from}|{TYPE_CREATE}|{key}|{value}|{}",
                role.code()
            ),
            StorageMessage::Read {
                trans_id,
                from,
                key,
            } => format!("{trans_id}|{from}|{TYPE_READ}|{key}"),
            StorageMessage::Update {
                trans_id,
                from,
                key,
                value,
                role,
            } => format!(
                "{trans_id}|{from}|{TYPE_UPDATE}|{key}|{value}|{}",
                role.code()
            ),
            StorageMessage::Delete {
                trans_id,
                from,
                key,
            } => format!("{trans_id}|{from}|{TYPE_DELETE}|{key}"),
            StorageMessage::Reply {
                trans_id,
                from,
                success,
            } => format!("{trans_id}|{from}|{TYPE_REPLY}|{}", *success as u8),
            StorageMessage::ReadReply {
                trans_id,
                from,
                value,
            } => format!("{trans_id}|{from}|{TYPE_READREPLY}|{value}"),
        };
        line.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let line = std::str::from_utf8(payload).map_err(|_| WireError::NotUtf8)?;
        let mut fields = line.split('|');

        let trans_id = take(&mut fields, "transID")?
            .parse::<u64>()
            .map_err(|_| WireError::InvalidField("transID"))?;
        let from = take(&mut fields, "from")?
            .parse::<NodeAddress>()
            .map_err(|_| WireError::InvalidField("from"))?;
        let ty = take(&mut fields, "type")?;

        match ty {
            TYPE_CREATE | TYPE_UPDATE => {
                let key = take(&mut fields, "key")?.to_string();
                // The value may legitimately be empty, and a trailing empty
                // field may be absent entirely.
                let value = fields.next().unwrap_or("").to_string();
                let role = parse_role(&mut fields)?;
                Ok(if ty == TYPE_CREATE {
                    StorageMessage::Create {
                        trans_id,
                        from,
                        key,
                        value,
                        role,
                    }
                } else {
                    StorageMessage::Update {
                        trans_id,
                        from,
                        key,
                        value,
                        role,
                    }
                })
            }
            TYPE_READ | TYPE_DELETE => {
                let key = take(&mut fields, "key")?.to_string();
                Ok(if ty == TYPE_READ {
                    StorageMessage::Read {
                        trans_id,
                        from,
                        key,
                    }
                } else {
                    StorageMessage::Delete {
                        trans_id,
                        from,
                        key,
                    }
                })
            }
            TYPE_REPLY => {
                let success = match take(&mut fields, "success")? {
                    "1" => true,
                    "0" => false,
                    _ => return Err(WireError::InvalidField("success")),
                };
                Ok(StorageMessage::Reply {
                    trans_id,
                    from,
                    success,
                })
            }
            TYPE_READREPLY => Ok(StorageMessage::ReadReply {
                trans_id,
                from,
                value: fields.next().unwrap_or("").to_string(),
            }),
            other => Err(WireError::UnknownType(other.to_string())),
        }
    }
}

fn take<'a>(
    fields: &mut impl Iterator<Item = &'a str>,
    name: &'static str,
) -> Result<&'a str> {
    fields.next().ok_or(WireError::MissingField(name))
}

fn parse_role<'a>(fields: &mut impl Iterator<Item = &'a str>) -> Result<ReplicaRole> {
    take(fields, "replica")?
        .parse::<u8>()
        .ok()
        .and_then(ReplicaRole::from_code)
        .ok_or(WireError::InvalidField("replica"))
}
