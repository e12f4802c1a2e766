use bitflags::bitflags;

bitflags! {
    /// QUERY option bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueryFlags: i32 {
        const TAILABLE_CURSOR   = 1 << 1;
        const SLAVE_OK          = 1 << 2;
        const NO_CURSOR_TIMEOUT = 1 << 4;
        const AWAIT_DATA        = 1 << 5;
        const EXHAUST           = 1 << 6;
        const PARTIAL           = 1 << 7;
    }
}

bitflags! {
    /// REPLY response bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReplyFlags: i32 {
        const CURSOR_NOT_FOUND   = 1 << 0;
        const QUERY_FAILURE      = 1 << 1;
        const SHARD_CONFIG_STALE = 1 << 2;
        const AWAIT_CAPABLE      = 1 << 3;
    }
}

bitflags! {
    /// INSERT option bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InsertFlags: i32 {
        const CONTINUE_ON_ERROR = 1 << 0;
    }
}

bitflags! {
    /// UPDATE option bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UpdateFlags: i32 {
        const UPSERT       = 1 << 0;
        const MULTI_UPDATE = 1 << 1;
    }
}

bitflags! {
    /// DELETE option bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeleteFlags: i32 {
        const SINGLE_REMOVE = 1 << 0;
    }
}
