//! Wire records for clients, inter-node commands, and state sync.
//!
//! Each record family is a closed enum whose first byte is an opcode. A
//! receiver peeks that byte to pick the schema for the rest of the buffer, so
//! no envelope is needed around the record itself.

use crate::codec::{
    decode_uint, encode_uint, record, CodecError, Cursor, Decode, Encode, TAG_WIDTH,
};

record! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Account {
        pub username: String,
        pub logged_in: bool,
    }
}

record! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Message {
        pub sender_username: String,
        pub recipient_username: String,
        pub body: String,
        /// Unix timestamp (seconds) taken when the message was sent.
        pub time: u64,
        pub delivered: bool,
        /// Whether the recipient was logged in when the message was sent.
        pub recipient_logged_in: bool,
    }
}

impl Account {
    pub fn new(username: impl Into<String>, logged_in: bool) -> Self {
        Self {
            username: username.into(),
            logged_in,
        }
    }
}

impl Message {
    /// Compares identity fields only, ignoring the delivery bookkeeping flags.
    pub fn same_message(&self, other: &Message) -> bool {
        self.sender_username == other.sender_username
            && self.recipient_username == other.recipient_username
            && self.body == other.body
            && self.time == other.time
    }
}

/// Declares a one-byte opcode enum that can be peeked from a buffer.
macro_rules! opcodes {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident = $value:literal),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $value),*
        }

        impl TryFrom<u8> for $name {
            type Error = CodecError;

            fn try_from(value: u8) -> Result<Self, CodecError> {
                match value {
                    $($value => Ok(Self::$variant),)*
                    other => Err(CodecError::UnknownOpcode(other)),
                }
            }
        }

        impl $name {
            /// Reads the opcode from the first byte without consuming the record.
            pub fn peek(input: &[u8]) -> Result<Self, CodecError> {
                let tag = decode_uint(input, TAG_WIDTH)? as u8;
                Self::try_from(tag)
            }
        }
    };
}

/// Declares an opcode-tagged enum of records. Variant names must match the
/// opcode enum's variants.
macro_rules! tagged {
    (
        $(#[$meta:meta])*
        pub enum $name:ident : $opcode:ident {
            $($variant:ident($record:ty)),* $(,)?
        }
    ) => {
        $(#[$meta])*
        pub enum $name {
            $($variant($record)),*
        }

        impl $name {
            pub fn opcode(&self) -> $opcode {
                match self {
                    $(Self::$variant(_) => $opcode::$variant),*
                }
            }
        }

        impl Encode for $name {
            fn encode_to(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
                encode_uint(self.opcode() as u64, TAG_WIDTH, out)?;
                match self {
                    $(Self::$variant(record) => record.encode_to(out)),*
                }
            }
        }

        impl Decode for $name {
            fn decode(input: &[u8]) -> Result<(Self, usize), CodecError> {
                let body = &input[TAG_WIDTH.min(input.len())..];
                let (value, consumed) = match $opcode::peek(input)? {
                    $($opcode::$variant => {
                        let (record, consumed) = <$record>::decode(body)?;
                        (Self::$variant(record), consumed)
                    })*
                };
                Ok((value, TAG_WIDTH + consumed))
            }
        }
    };
}

// Client-facing operations.

opcodes! {
    pub enum ClientOpcode {
        LogInAccount = 0,
        CreateAccount = 1,
        ListAccounts = 2,
        SendMessage = 3,
        DeliverUndeliveredMessages = 4,
        DeleteAccount = 5,
        LogOutAccount = 6,
        AcknowledgeMessages = 7,
    }
}

record! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct UsernameRequest {
        pub username: String,
    }
}

record! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ListAccountsRequest {
        pub text_wildcard: String,
    }
}

record! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SendMessageRequest {
        pub message: String,
        pub recipient_username: String,
        pub sender_username: String,
    }
}

record! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DeliverUndeliveredMessagesRequest {
        pub username: String,
        /// Only surface messages that arrived while the recipient was logged in.
        pub logged_in: bool,
    }
}

record! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct AcknowledgeMessagesRequest {
        pub messages: Vec<Message>,
    }
}

record! {
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct ErrorResponse {
        pub error: String,
    }
}

record! {
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct ListAccountsResponse {
        pub accounts: Vec<Account>,
        pub error: String,
    }
}

record! {
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct DeliverUndeliveredMessagesResponse {
        pub messages: Vec<Message>,
        pub error: String,
    }
}

tagged! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ClientRequest: ClientOpcode {
        LogInAccount(UsernameRequest),
        CreateAccount(UsernameRequest),
        ListAccounts(ListAccountsRequest),
        SendMessage(SendMessageRequest),
        DeliverUndeliveredMessages(DeliverUndeliveredMessagesRequest),
        DeleteAccount(UsernameRequest),
        LogOutAccount(UsernameRequest),
        AcknowledgeMessages(AcknowledgeMessagesRequest),
    }
}

tagged! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ClientResponse: ClientOpcode {
        LogInAccount(ErrorResponse),
        CreateAccount(ErrorResponse),
        ListAccounts(ListAccountsResponse),
        SendMessage(ErrorResponse),
        DeliverUndeliveredMessages(DeliverUndeliveredMessagesResponse),
        DeleteAccount(ErrorResponse),
        LogOutAccount(ErrorResponse),
        AcknowledgeMessages(ErrorResponse),
    }
}

impl ClientResponse {
    /// An empty response for `opcode` carrying only `error`.
    pub fn failure(opcode: ClientOpcode, error: impl Into<String>) -> Self {
        let error = error.into();
        match opcode {
            ClientOpcode::LogInAccount => Self::LogInAccount(ErrorResponse { error }),
            ClientOpcode::CreateAccount => Self::CreateAccount(ErrorResponse { error }),
            ClientOpcode::ListAccounts => Self::ListAccounts(ListAccountsResponse {
                error,
                ..Default::default()
            }),
            ClientOpcode::SendMessage => Self::SendMessage(ErrorResponse { error }),
            ClientOpcode::DeliverUndeliveredMessages => {
                Self::DeliverUndeliveredMessages(DeliverUndeliveredMessagesResponse {
                    error,
                    ..Default::default()
                })
            }
            ClientOpcode::DeleteAccount => Self::DeleteAccount(ErrorResponse { error }),
            ClientOpcode::LogOutAccount => Self::LogOutAccount(ErrorResponse { error }),
            ClientOpcode::AcknowledgeMessages => Self::AcknowledgeMessages(ErrorResponse { error }),
        }
    }

    /// The `error` field every response carries; empty on success.
    pub fn error(&self) -> &str {
        match self {
            Self::LogInAccount(r)
            | Self::CreateAccount(r)
            | Self::SendMessage(r)
            | Self::DeleteAccount(r)
            | Self::LogOutAccount(r)
            | Self::AcknowledgeMessages(r) => &r.error,
            Self::ListAccounts(r) => &r.error,
            Self::DeliverUndeliveredMessages(r) => &r.error,
        }
    }
}

// Store operations forwarded over the command channel.

opcodes! {
    pub enum StoreOpcode {
        DeleteAccount = 0,
        DeleteAll = 1,
        GetAccounts = 2,
        GetAccountLoggedIn = 3,
        GetMessages = 4,
        HasAccount = 5,
        UpsertAccount = 6,
        UpsertMessage = 7,
    }
}

record! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct NoFields {}
}

record! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct GetMessagesRequest {
        pub username: String,
        pub logged_in_only: bool,
    }
}

record! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct UpsertAccountRequest {
        pub account: Account,
    }
}

record! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct UpsertMessageRequest {
        pub message: Message,
    }
}

record! {
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct GetAccountsResponse {
        pub accounts: Vec<Account>,
        pub error: String,
    }
}

record! {
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct FlagResponse {
        pub value: bool,
        pub error: String,
    }
}

record! {
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct GetMessagesResponse {
        pub messages: Vec<Message>,
        pub error: String,
    }
}

tagged! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum StoreRequest: StoreOpcode {
        DeleteAccount(UsernameRequest),
        DeleteAll(NoFields),
        GetAccounts(NoFields),
        GetAccountLoggedIn(UsernameRequest),
        GetMessages(GetMessagesRequest),
        HasAccount(UsernameRequest),
        UpsertAccount(UpsertAccountRequest),
        UpsertMessage(UpsertMessageRequest),
    }
}

tagged! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum StoreResponse: StoreOpcode {
        DeleteAccount(ErrorResponse),
        DeleteAll(ErrorResponse),
        GetAccounts(GetAccountsResponse),
        GetAccountLoggedIn(FlagResponse),
        GetMessages(GetMessagesResponse),
        HasAccount(FlagResponse),
        UpsertAccount(ErrorResponse),
        UpsertMessage(ErrorResponse),
    }
}

impl StoreRequest {
    /// Whether applying this request mutates the tables.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::DeleteAccount(_) | Self::DeleteAll(_) | Self::UpsertAccount(_) | Self::UpsertMessage(_)
        )
    }
}

impl StoreResponse {
    /// An empty response for `opcode` carrying only `error`.
    pub fn failure(opcode: StoreOpcode, error: impl Into<String>) -> Self {
        let error = error.into();
        match opcode {
            StoreOpcode::DeleteAccount => Self::DeleteAccount(ErrorResponse { error }),
            StoreOpcode::DeleteAll => Self::DeleteAll(ErrorResponse { error }),
            StoreOpcode::GetAccounts => Self::GetAccounts(GetAccountsResponse {
                error,
                ..Default::default()
            }),
            StoreOpcode::GetAccountLoggedIn => Self::GetAccountLoggedIn(FlagResponse {
                error,
                ..Default::default()
            }),
            StoreOpcode::GetMessages => Self::GetMessages(GetMessagesResponse {
                error,
                ..Default::default()
            }),
            StoreOpcode::HasAccount => Self::HasAccount(FlagResponse {
                error,
                ..Default::default()
            }),
            StoreOpcode::UpsertAccount => Self::UpsertAccount(ErrorResponse { error }),
            StoreOpcode::UpsertMessage => Self::UpsertMessage(ErrorResponse { error }),
        }
    }

    pub fn error(&self) -> &str {
        match self {
            Self::DeleteAccount(r) | Self::DeleteAll(r) | Self::UpsertAccount(r) | Self::UpsertMessage(r) => {
                &r.error
            }
            Self::GetAccounts(r) => &r.error,
            Self::GetAccountLoggedIn(r) | Self::HasAccount(r) => &r.error,
            Self::GetMessages(r) => &r.error,
        }
    }
}

// Full-state snapshots pushed over the sync channel.

opcodes! {
    pub enum SyncOpcode {
        Snapshot = 8,
    }
}

record! {
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct Snapshot {
        pub accounts: Vec<Account>,
        pub messages: Vec<Message>,
    }
}

tagged! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SyncRecord: SyncOpcode {
        Snapshot(Snapshot),
    }
}

// Connection handshakes. These precede framing and have a fixed size.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHello {
    pub machine_id: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncHello {
    pub machine_id: usize,
    /// Whether the sender believed itself primary at the end of its last run.
    pub was_primary: bool,
}

impl CommandHello {
    pub const LEN: usize = TAG_WIDTH;
}

impl SyncHello {
    pub const LEN: usize = TAG_WIDTH + 1;
}

impl Encode for CommandHello {
    fn encode_to(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_uint(self.machine_id as u64, TAG_WIDTH, out)
    }
}

impl Decode for CommandHello {
    fn decode(input: &[u8]) -> Result<(Self, usize), CodecError> {
        let machine_id = decode_uint(input, TAG_WIDTH)? as usize;
        Ok((Self { machine_id }, Self::LEN))
    }
}

impl Encode for SyncHello {
    fn encode_to(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_uint(self.machine_id as u64, TAG_WIDTH, out)?;
        self.was_primary.encode_to(out)
    }
}

impl Decode for SyncHello {
    fn decode(input: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut cursor = Cursor::new(input);
        let machine_id = cursor.read_uint(TAG_WIDTH)? as usize;
        let was_primary = cursor.read::<bool>()?;
        Ok((
            Self {
                machine_id,
                was_primary,
            },
            cursor.consumed(),
        ))
    }
}
