//! Typed value objects for every client->server and server->client wire
//! message (§4.B), plus the row-delta / compression envelope types that
//! `spec.md` names in §6's "bit-exact framing rules" but does not lay out
//! field-by-field (`RowSizeHint`, `BsatnRowList`, `CompressableQueryUpdate`).

use crate::bsatn::{DecodeError, Deserialize, Deserializer, EncodeError, Serialize, Serializer};
use crate::identity::{ConnectionId, Identity, TimeDuration, Timestamp};
use bytes::Bytes;

pub type RequestId = u32;
pub type QueryId = u32;
pub type TableId = u32;

/// Flags accepted by `CallReducer`/`CallProcedure` (§4.B).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum CallReducerFlags {
    /// Wait for a `TransactionUpdate` unconditionally.
    #[default]
    FullUpdate = 0,
    /// Suppress the success notification unless subscribed rows are touched.
    NoSuccessNotify = 1,
}

impl Serialize for CallReducerFlags {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        ser.put_u8(*self as u8);
        Ok(())
    }
}

impl Deserialize for CallReducerFlags {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        match de.get_u8()? {
            0 => Ok(CallReducerFlags::FullUpdate),
            1 => Ok(CallReducerFlags::NoSuccessNotify),
            other => Err(DecodeError::InvalidData(format!("bad CallReducerFlags {other}"))),
        }
    }
}

macro_rules! product {
    (struct $name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name {
            $(pub $field: $ty,)*
        }

        impl Serialize for $name {
            fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
                $(self.$field.serialize(ser)?;)*
                Ok(())
            }
        }

        impl Deserialize for $name {
            fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
                Ok($name {
                    $($field: Deserialize::deserialize(de)?,)*
                })
            }
        }
    };
}

product!(struct CallReducer {
    name: String,
    args: Bytes,
    request_id: RequestId,
    flags: CallReducerFlags,
});

product!(struct Subscribe {
    queries: Vec<String>,
    request_id: RequestId,
});

product!(struct OneOffQuery {
    message_id: Bytes,
    query: String,
});

product!(struct SubscribeSingle {
    query: String,
    request_id: RequestId,
    query_id: QueryId,
});

product!(struct SubscribeMulti {
    queries: Vec<String>,
    request_id: RequestId,
    query_id: QueryId,
});

product!(struct Unsubscribe {
    request_id: RequestId,
    query_id: QueryId,
});

product!(struct UnsubscribeMulti {
    request_id: RequestId,
    query_id: QueryId,
});

product!(struct CallProcedure {
    name: String,
    args: Bytes,
    request_id: RequestId,
    flags: CallReducerFlags,
});

/// Every message a client may send, tagged per §4.B's table.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    CallReducer(CallReducer),
    Subscribe(Subscribe),
    OneOffQuery(OneOffQuery),
    SubscribeSingle(SubscribeSingle),
    SubscribeMulti(SubscribeMulti),
    Unsubscribe(Unsubscribe),
    UnsubscribeMulti(UnsubscribeMulti),
    CallProcedure(CallProcedure),
}

impl Serialize for ClientMessage {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        match self {
            ClientMessage::CallReducer(m) => {
                ser.put_u8(0);
                m.serialize(ser)
            }
            ClientMessage::Subscribe(m) => {
                ser.put_u8(1);
                m.serialize(ser)
            }
            ClientMessage::OneOffQuery(m) => {
                ser.put_u8(2);
                m.serialize(ser)
            }
            ClientMessage::SubscribeSingle(m) => {
                ser.put_u8(3);
                m.serialize(ser)
            }
            ClientMessage::SubscribeMulti(m) => {
                ser.put_u8(4);
                m.serialize(ser)
            }
            ClientMessage::Unsubscribe(m) => {
                ser.put_u8(5);
                m.serialize(ser)
            }
            ClientMessage::UnsubscribeMulti(m) => {
                ser.put_u8(6);
                m.serialize(ser)
            }
            ClientMessage::CallProcedure(m) => {
                ser.put_u8(7);
                m.serialize(ser)
            }
        }
    }
}

impl Deserialize for ClientMessage {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        Ok(match de.get_u8()? {
            0 => ClientMessage::CallReducer(CallReducer::deserialize(de)?),
            1 => ClientMessage::Subscribe(Subscribe::deserialize(de)?),
            2 => ClientMessage::OneOffQuery(OneOffQuery::deserialize(de)?),
            3 => ClientMessage::SubscribeSingle(SubscribeSingle::deserialize(de)?),
            4 => ClientMessage::SubscribeMulti(SubscribeMulti::deserialize(de)?),
            5 => ClientMessage::Unsubscribe(Unsubscribe::deserialize(de)?),
            6 => ClientMessage::UnsubscribeMulti(UnsubscribeMulti::deserialize(de)?),
            7 => ClientMessage::CallProcedure(CallProcedure::deserialize(de)?),
            other => return Err(DecodeError::InvalidEnumTag(other)),
        })
    }
}

/// How large each row in a [`BsatnRowList`] is, so the list's flat byte
/// buffer can be sliced back into individual rows (§6).
#[derive(Clone, Debug, PartialEq)]
pub enum RowSizeHint {
    FixedSize(u16),
    RowOffsets(Vec<u64>),
}

impl Serialize for RowSizeHint {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        match self {
            RowSizeHint::FixedSize(n) => {
                ser.put_u8(0);
                n.serialize(ser)
            }
            RowSizeHint::RowOffsets(offsets) => {
                ser.put_u8(1);
                offsets.serialize(ser)
            }
        }
    }
}

impl Deserialize for RowSizeHint {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        Ok(match de.get_u8()? {
            0 => RowSizeHint::FixedSize(u16::deserialize(de)?),
            1 => RowSizeHint::RowOffsets(Vec::<u64>::deserialize(de)?),
            other => return Err(DecodeError::InvalidEnumTag(other)),
        })
    }
}

/// A flat buffer of BSATN-encoded rows plus the hint needed to split it back
/// into individual rows.
#[derive(Clone, Debug, PartialEq)]
pub struct BsatnRowList {
    pub size_hint: RowSizeHint,
    pub rows_data: Bytes,
}

impl Serialize for BsatnRowList {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        self.size_hint.serialize(ser)?;
        self.rows_data.serialize(ser)
    }
}

impl Deserialize for BsatnRowList {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        Ok(BsatnRowList {
            size_hint: RowSizeHint::deserialize(de)?,
            rows_data: Bytes::deserialize(de)?,
        })
    }
}

impl BsatnRowList {
    /// Split `rows_data` into individual BSATN-encoded row buffers.
    pub fn rows(&self) -> Result<Vec<Bytes>, DecodeError> {
        match &self.size_hint {
            RowSizeHint::FixedSize(n) => {
                let n = *n as usize;
                if n == 0 {
                    return if self.rows_data.is_empty() {
                        Ok(Vec::new())
                    } else {
                        Err(DecodeError::InvalidData("zero-size fixed row hint with non-empty data".into()))
                    };
                }
                if self.rows_data.len() % n != 0 {
                    return Err(DecodeError::InvalidData(format!(
                        "row data length {} not a multiple of fixed row size {}",
                        self.rows_data.len(),
                        n
                    )));
                }
                Ok(self.rows_data.chunks(n).map(Bytes::copy_from_slice).collect())
            }
            RowSizeHint::RowOffsets(offsets) => {
                let mut rows = Vec::with_capacity(offsets.len());
                let mut prev = 0u64;
                for &offset in offsets.iter().chain(std::iter::once(&(self.rows_data.len() as u64))) {
                    if offset < prev || offset > self.rows_data.len() as u64 {
                        return Err(DecodeError::InvalidData("row offset out of range".into()));
                    }
                    rows.push(self.rows_data.slice(prev as usize..offset as usize));
                    prev = offset;
                }
                Ok(rows)
            }
        }
    }
}

/// One query's `(deletes, inserts)` row delta (§3), uncompressed.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryUpdate {
    pub deletes: BsatnRowList,
    pub inserts: BsatnRowList,
}

impl Serialize for QueryUpdate {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        self.deletes.serialize(ser)?;
        self.inserts.serialize(ser)
    }
}

impl Deserialize for QueryUpdate {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        Ok(QueryUpdate {
            deletes: BsatnRowList::deserialize(de)?,
            inserts: BsatnRowList::deserialize(de)?,
        })
    }
}

/// A row delta that may independently carry compression (§4.C).
#[derive(Clone, Debug, PartialEq)]
pub enum CompressableQueryUpdate {
    Uncompressed(QueryUpdate),
    /// BSATN-encoded `QueryUpdate`, brotli-compressed.
    Brotli(Bytes),
    /// BSATN-encoded `QueryUpdate`, gzip-compressed.
    Gzip(Bytes),
}

impl Serialize for CompressableQueryUpdate {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        match self {
            CompressableQueryUpdate::Uncompressed(qu) => {
                ser.put_u8(0);
                qu.serialize(ser)
            }
            CompressableQueryUpdate::Brotli(bytes) => {
                ser.put_u8(1);
                bytes.serialize(ser)
            }
            CompressableQueryUpdate::Gzip(bytes) => {
                ser.put_u8(2);
                bytes.serialize(ser)
            }
        }
    }
}

impl Deserialize for CompressableQueryUpdate {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        Ok(match de.get_u8()? {
            0 => CompressableQueryUpdate::Uncompressed(QueryUpdate::deserialize(de)?),
            1 => CompressableQueryUpdate::Brotli(Bytes::deserialize(de)?),
            2 => CompressableQueryUpdate::Gzip(Bytes::deserialize(de)?),
            other => return Err(DecodeError::InvalidEnumTag(other)),
        })
    }
}

impl CompressableQueryUpdate {
    /// Decompress (if needed) and decode to a plain [`QueryUpdate`].
    pub fn into_query_update(self) -> Result<QueryUpdate, super::CompressionError> {
        match self {
            CompressableQueryUpdate::Uncompressed(qu) => Ok(qu),
            CompressableQueryUpdate::Brotli(bytes) => {
                let decompressed = super::compression::decompress_brotli(&bytes)?;
                QueryUpdate::deserialize(&mut Deserializer::new(&decompressed)).map_err(|e| {
                    super::CompressionError::DecompressionFailed {
                        algorithm: "brotli",
                        cause: e.to_string(),
                    }
                })
            }
            CompressableQueryUpdate::Gzip(bytes) => {
                let decompressed = super::compression::decompress_gzip(&bytes)?;
                QueryUpdate::deserialize(&mut Deserializer::new(&decompressed)).map_err(|e| {
                    super::CompressionError::DecompressionFailed {
                        algorithm: "gzip",
                        cause: e.to_string(),
                    }
                })
            }
        }
    }
}

product!(struct TableUpdate {
    table_id: TableId,
    table_name: String,
    num_rows_hint: u64,
    deltas: Vec<CompressableQueryUpdate>,
});

#[derive(Clone, Debug, PartialEq, Default)]
pub struct DatabaseUpdate {
    pub tables: Vec<TableUpdate>,
}

impl DatabaseUpdate {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl Serialize for DatabaseUpdate {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        self.tables.serialize(ser)
    }
}

impl Deserialize for DatabaseUpdate {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        Ok(DatabaseUpdate {
            tables: Vec::deserialize(de)?,
        })
    }
}

product!(struct ReducerCallInfo {
    reducer_name: String,
    reducer_id: u32,
    args: Bytes,
    request_id: RequestId,
});

/// The status of a [`TransactionUpdate`] (§4.B).
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateStatus {
    Committed(DatabaseUpdate),
    Failed(String),
    OutOfEnergy,
}

impl Serialize for UpdateStatus {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        match self {
            UpdateStatus::Committed(u) => {
                ser.put_u8(0);
                u.serialize(ser)
            }
            UpdateStatus::Failed(msg) => {
                ser.put_u8(1);
                msg.serialize(ser)
            }
            UpdateStatus::OutOfEnergy => {
                ser.put_u8(2);
                Ok(())
            }
        }
    }
}

impl Deserialize for UpdateStatus {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        Ok(match de.get_u8()? {
            0 => UpdateStatus::Committed(DatabaseUpdate::deserialize(de)?),
            1 => UpdateStatus::Failed(String::deserialize(de)?),
            2 => UpdateStatus::OutOfEnergy,
            other => return Err(DecodeError::InvalidEnumTag(other)),
        })
    }
}

product!(struct TransactionUpdate {
    status: UpdateStatus,
    timestamp: Timestamp,
    caller_identity: Identity,
    caller_connection_id: ConnectionId,
    reducer_call: ReducerCallInfo,
    energy_quanta_used: u128,
    host_execution_duration: TimeDuration,
});

product!(struct TransactionUpdateLight {
    request_id: RequestId,
    update: DatabaseUpdate,
});

product!(struct IdentityToken {
    identity: Identity,
    token: String,
    connection_id: ConnectionId,
});

product!(struct InitialSubscription {
    database_update: DatabaseUpdate,
    request_id: RequestId,
    total_host_execution_duration: TimeDuration,
});

product!(struct OneOffTable {
    table_name: String,
    rows: Vec<Bytes>,
});

product!(struct OneOffQueryResponse {
    message_id: Bytes,
    error: Option<String>,
    tables: Vec<OneOffTable>,
    total_host_execution_duration: TimeDuration,
});

product!(struct SubscribeApplied {
    request_id: RequestId,
    query_id: QueryId,
    initial_update: DatabaseUpdate,
});

product!(struct UnsubscribeApplied {
    request_id: RequestId,
    query_id: QueryId,
});

/// Response to an error at any point of the subscription lifecycle. If
/// `request_id` is absent, the client must drop all subscriptions (§4.E).
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionError {
    pub request_id: Option<RequestId>,
    pub query_id: Option<QueryId>,
    pub error: String,
}

impl Serialize for SubscriptionError {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        self.request_id.serialize(ser)?;
        self.query_id.serialize(ser)?;
        self.error.serialize(ser)
    }
}

impl Deserialize for SubscriptionError {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        Ok(SubscriptionError {
            request_id: Deserialize::deserialize(de)?,
            query_id: Deserialize::deserialize(de)?,
            error: Deserialize::deserialize(de)?,
        })
    }
}

product!(struct SubscribeMultiApplied {
    request_id: RequestId,
    query_id: QueryId,
    initial_update: DatabaseUpdate,
});

product!(struct UnsubscribeMultiApplied {
    request_id: RequestId,
    query_id: QueryId,
});

/// The result of a procedure call (§4.B).
#[derive(Clone, Debug, PartialEq)]
pub enum ProcedureStatus {
    Returned(Bytes),
    Failed(String),
}

impl Serialize for ProcedureStatus {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        match self {
            ProcedureStatus::Returned(b) => {
                ser.put_u8(0);
                b.serialize(ser)
            }
            ProcedureStatus::Failed(msg) => {
                ser.put_u8(1);
                msg.serialize(ser)
            }
        }
    }
}

impl Deserialize for ProcedureStatus {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        Ok(match de.get_u8()? {
            0 => ProcedureStatus::Returned(Bytes::deserialize(de)?),
            1 => ProcedureStatus::Failed(String::deserialize(de)?),
            other => return Err(DecodeError::InvalidEnumTag(other)),
        })
    }
}

product!(struct ProcedureResult {
    request_id: RequestId,
    timestamp: Timestamp,
    total_host_execution_duration: TimeDuration,
    status: ProcedureStatus,
});

/// Every message a server may send, tagged per §4.B's table.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    InitialSubscription(InitialSubscription),
    TransactionUpdate(TransactionUpdate),
    TransactionUpdateLight(TransactionUpdateLight),
    IdentityToken(IdentityToken),
    OneOffQueryResponse(OneOffQueryResponse),
    SubscribeApplied(SubscribeApplied),
    UnsubscribeApplied(UnsubscribeApplied),
    SubscriptionError(SubscriptionError),
    SubscribeMultiApplied(SubscribeMultiApplied),
    UnsubscribeMultiApplied(UnsubscribeMultiApplied),
    ProcedureResult(ProcedureResult),
}

impl Serialize for ServerMessage {
    fn serialize(&self, ser: &mut Serializer) -> Result<(), EncodeError> {
        macro_rules! tagged {
            ($tag:expr, $inner:expr) => {{
                ser.put_u8($tag);
                $inner.serialize(ser)
            }};
        }
        match self {
            ServerMessage::InitialSubscription(m) => tagged!(0, m),
            ServerMessage::TransactionUpdate(m) => tagged!(1, m),
            ServerMessage::TransactionUpdateLight(m) => tagged!(2, m),
            ServerMessage::IdentityToken(m) => tagged!(3, m),
            ServerMessage::OneOffQueryResponse(m) => tagged!(4, m),
            ServerMessage::SubscribeApplied(m) => tagged!(5, m),
            ServerMessage::UnsubscribeApplied(m) => tagged!(6, m),
            ServerMessage::SubscriptionError(m) => tagged!(7, m),
            ServerMessage::SubscribeMultiApplied(m) => tagged!(8, m),
            ServerMessage::UnsubscribeMultiApplied(m) => tagged!(9, m),
            ServerMessage::ProcedureResult(m) => tagged!(10, m),
        }
    }
}

impl Deserialize for ServerMessage {
    fn deserialize(de: &mut Deserializer) -> Result<Self, DecodeError> {
        Ok(match de.get_u8()? {
            0 => ServerMessage::InitialSubscription(Deserialize::deserialize(de)?),
            1 => ServerMessage::TransactionUpdate(Deserialize::deserialize(de)?),
            2 => ServerMessage::TransactionUpdateLight(Deserialize::deserialize(de)?),
            3 => ServerMessage::IdentityToken(Deserialize::deserialize(de)?),
            4 => ServerMessage::OneOffQueryResponse(Deserialize::deserialize(de)?),
            5 => ServerMessage::SubscribeApplied(Deserialize::deserialize(de)?),
            6 => ServerMessage::UnsubscribeApplied(Deserialize::deserialize(de)?),
            7 => ServerMessage::SubscriptionError(Deserialize::deserialize(de)?),
            8 => ServerMessage::SubscribeMultiApplied(Deserialize::deserialize(de)?),
            9 => ServerMessage::UnsubscribeMultiApplied(Deserialize::deserialize(de)?),
            10 => ServerMessage::ProcedureResult(Deserialize::deserialize(de)?),
            other => return Err(DecodeError::InvalidEnumTag(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsatn;

    fn fixed_row_list(rows: &[&[u8]]) -> BsatnRowList {
        let width = rows.first().map(|r| r.len()).unwrap_or(0) as u16;
        let mut data = Vec::new();
        for r in rows {
            data.extend_from_slice(r);
        }
        BsatnRowList {
            size_hint: RowSizeHint::FixedSize(width),
            rows_data: Bytes::from(data),
        }
    }

    #[test]
    fn client_message_round_trip() {
        let msg = ClientMessage::CallReducer(CallReducer {
            name: "add".into(),
            args: Bytes::new(),
            request_id: 7,
            flags: CallReducerFlags::FullUpdate,
        });
        let bytes = bsatn::to_vec(&msg).unwrap();
        assert_eq!(bytes[0], 0);
        assert_eq!(bsatn::from_slice::<ClientMessage>(&bytes).unwrap(), msg);
    }

    #[test]
    fn server_message_round_trip_every_variant() {
        let variants = vec![
            ServerMessage::IdentityToken(IdentityToken {
                identity: Identity::ZERO,
                token: "tok".into(),
                connection_id: ConnectionId(123),
            }),
            ServerMessage::SubscriptionError(SubscriptionError {
                request_id: None,
                query_id: None,
                error: "fatal".into(),
            }),
            ServerMessage::TransactionUpdate(TransactionUpdate {
                status: UpdateStatus::OutOfEnergy,
                timestamp: Timestamp(0),
                caller_identity: Identity::ZERO,
                caller_connection_id: ConnectionId(0),
                reducer_call: ReducerCallInfo {
                    reducer_name: "add".into(),
                    reducer_id: 1,
                    args: Bytes::new(),
                    request_id: 7,
                },
                energy_quanta_used: 0,
                host_execution_duration: TimeDuration(0),
            }),
        ];
        for msg in variants {
            let bytes = bsatn::to_vec(&msg).unwrap();
            assert_eq!(bsatn::from_slice::<ServerMessage>(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn unknown_server_message_tag_is_rejected() {
        let err = bsatn::from_slice::<ServerMessage>(&[99]).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidEnumTag(99)));
    }

    #[test]
    fn bsatn_row_list_splits_fixed_size_rows() {
        let list = fixed_row_list(&[&[1, 0, 0, 0], &[2, 0, 0, 0]]);
        let rows = list.rows().unwrap();
        assert_eq!(rows, vec![Bytes::from_static(&[1, 0, 0, 0]), Bytes::from_static(&[2, 0, 0, 0])]);
    }

    #[test]
    fn bsatn_row_list_splits_by_offsets() {
        let data = Bytes::from_static(&[1, 2, 2, 3, 3, 3]);
        let list = BsatnRowList {
            size_hint: RowSizeHint::RowOffsets(vec![1, 3]),
            rows_data: data,
        };
        let rows = list.rows().unwrap();
        assert_eq!(
            rows,
            vec![Bytes::from_static(&[1]), Bytes::from_static(&[2, 2]), Bytes::from_static(&[3, 3, 3])]
        );
    }
}
