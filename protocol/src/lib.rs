pub mod deserializer;
pub mod message;

pub use deserializer::{
    ParseError, get_block_by_number_request, parse_block_response, parse_feed_message,
    subscribe_new_heads_request,
};
pub use message::{Block, FeedMessage, HeadNotification, PartialHeader};
