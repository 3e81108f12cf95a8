//! Numeric identifiers fixed by the wire protocol.

/// Header and body map keys.
pub mod key {
    pub const CODE: u8 = 0x00;
    pub const SYNC: u8 = 0x01;
    pub const SCHEMA_VERSION: u8 = 0x05;

    pub const SPACE_ID: u8 = 0x10;
    pub const INDEX_ID: u8 = 0x11;
    pub const LIMIT: u8 = 0x12;
    pub const OFFSET: u8 = 0x13;
    pub const ITERATOR: u8 = 0x14;
    pub const INDEX_BASE: u8 = 0x15;

    pub const KEY: u8 = 0x20;
    pub const TUPLE: u8 = 0x21;
    pub const FUNCTION_NAME: u8 = 0x22;
    pub const USER_NAME: u8 = 0x23;
    pub const EXPR: u8 = 0x27;
    pub const OPS: u8 = 0x28;

    pub const DATA: u8 = 0x30;
    pub const ERROR_24: u8 = 0x31;
    pub const METADATA: u8 = 0x32;

    pub const SQL_TEXT: u8 = 0x40;
    pub const SQL_BIND: u8 = 0x41;
    pub const SQL_INFO: u8 = 0x42;
    pub const STMT_ID: u8 = 0x43;

    pub const ERROR: u8 = 0x52;

    /// Keys inside the `SQL_INFO` map.
    pub const SQL_INFO_ROW_COUNT: u8 = 0x00;
    pub const SQL_INFO_AUTOINCREMENT_IDS: u8 = 0x01;

    /// Keys inside each `METADATA` entry.
    pub const FIELD_NAME: u8 = 0x00;
    pub const FIELD_TYPE: u8 = 0x01;
}

/// Request types carried under [`key::CODE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Select,
    Insert,
    Replace,
    Update,
    Delete,
    Call16,
    Auth,
    Eval,
    Upsert,
    Call,
    Execute,
    Nop,
    Prepare,
    Ping,
}

impl RequestType {
    pub const fn code(self) -> u32 {
        match self {
            RequestType::Select => 1,
            RequestType::Insert => 2,
            RequestType::Replace => 3,
            RequestType::Update => 4,
            RequestType::Delete => 5,
            RequestType::Call16 => 6,
            RequestType::Auth => 7,
            RequestType::Eval => 8,
            RequestType::Upsert => 9,
            RequestType::Call => 10,
            RequestType::Execute => 11,
            RequestType::Nop => 12,
            RequestType::Prepare => 13,
            RequestType::Ping => 64,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => RequestType::Select,
            2 => RequestType::Insert,
            3 => RequestType::Replace,
            4 => RequestType::Update,
            5 => RequestType::Delete,
            6 => RequestType::Call16,
            7 => RequestType::Auth,
            8 => RequestType::Eval,
            9 => RequestType::Upsert,
            10 => RequestType::Call,
            11 => RequestType::Execute,
            12 => RequestType::Nop,
            13 => RequestType::Prepare,
            64 => RequestType::Ping,
            _ => return None,
        })
    }

    /// Responses to these carry SQL metadata rather than plain tuples.
    pub fn is_sql(self) -> bool {
        matches!(self, RequestType::Execute | RequestType::Prepare)
    }
}

/// Status codes: `OK`, or `ERROR_FLAG | code` for a server error.
pub mod status {
    pub const OK: u32 = 0x00;
    pub const ERROR_FLAG: u32 = 0x8000;
}

/// Server error codes the client reacts to.
pub mod error_code {
    pub const READONLY: u32 = 7;
    pub const NO_SUCH_SPACE: u32 = 36;
    pub const TIMEOUT: u32 = 78;
    pub const WRONG_SCHEMA_VERSION: u32 = 109;
    pub const LOADING: u32 = 116;
    pub const LOCAL_INSTANCE_ID_IS_READ_ONLY: u32 = 128;
}

/// System catalog spaces.
pub mod space {
    pub const VSPACE: u32 = 281;
    pub const VINDEX: u32 = 289;
    /// Primary index of both catalog views.
    pub const PRIMARY: u32 = 0;
}

/// Index iteration order for selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IteratorType {
    #[default]
    Eq,
    Req,
    All,
    Lt,
    Le,
    Ge,
    Gt,
}

impl IteratorType {
    pub const fn code(self) -> u32 {
        match self {
            IteratorType::Eq => 0,
            IteratorType::Req => 1,
            IteratorType::All => 2,
            IteratorType::Lt => 3,
            IteratorType::Le => 4,
            IteratorType::Ge => 5,
            IteratorType::Gt => 6,
        }
    }
}
