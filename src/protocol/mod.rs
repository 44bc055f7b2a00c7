pub mod codec;
pub mod handshake;
pub mod packet;
pub mod reply;

pub use codec::{rewrite_sequence, PacketCodec};
pub use handshake::{compute_auth_response, HandshakeResponse, InitialHandshake};
pub use packet::{capabilities, Command, Packet, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};
pub use reply::{
    is_eof_packet, is_err_packet, is_local_infile_request, is_ok_packet, make_error, make_ok,
    EofPacket, ErrPacket, OkPacket, ReplyTracker, SERVER_MORE_RESULTS_EXISTS,
    SERVER_SESSION_STATE_CHANGED, SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS,
};
