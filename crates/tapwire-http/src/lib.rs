//! HTTP/1.x plumbing shared by the proxy pipeline: request/response head
//! parsing and serialization, body framing modes, the hop-by-hop header
//! set, and the transparent body codec.

mod codec;
mod head;

pub use codec::{
    decode_body, encode_body, is_text_content_type, BodyCodecError, ContentEncoding,
};
pub use head::{
    is_hop_by_hop, parse_chunk_size_line, parse_request_head, parse_response_head,
    serialize_request_head, serialize_response_head, BodyMode, HttpVersion, RequestHead,
    ResponseHead,
};
