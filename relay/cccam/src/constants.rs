/**
    Length of the raw seed the server sends on connect.
*/
pub const SEED_LEN: usize = 16;

/**
    Literal written after the password and expected back in the login ack.
    Only the first five bytes are compared.
*/
pub const HANDSHAKE_TAG: &[u8; 6] = b"CCcam\0";

/**
    Length of the zero-padded username field sent during login.
*/
pub const USERNAME_LEN: usize = 20;

/**
    Length of the login acknowledgement.
*/
pub const ACK_LEN: usize = 20;

/**
    Largest message (header included) accepted from the server.
*/
pub const MAX_MESSAGE_SIZE: usize = 512;

/**
    Largest body length a header may declare.
*/
pub const MAX_BODY_LEN: usize = MAX_MESSAGE_SIZE - 2;

/**
    Only directly attached cards are used; relayed shares are never routed to.
*/
pub const ELIGIBLE_HOP: u8 = 0;

pub const DEFAULT_VERSION: &str = "2.0.11";
pub const DEFAULT_BUILD: &str = "2892";
