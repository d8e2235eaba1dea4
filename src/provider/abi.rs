//! Solidity ABI helpers over `ethers` types: event topics, call data and typed decoding.

use ethers::abi::{self as ethabi, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::{id, keccak256};

/// `Transfer(address,address,uint256)`
pub const TRANSFER_EVENT: &str = "Transfer(address,address,uint256)";
/// `Open(bytes32,address,uint256,address,bytes32,uint256)` emitted by the HTLC contract
pub const HTLC_OPEN_EVENT: &str = "Open(bytes32,address,uint256,address,bytes32,uint256)";
pub const HTLC_REDEEM_EVENT: &str = "Redeem(bytes32,bytes32)";
pub const HTLC_REFUND_EVENT: &str = "Refund(bytes32)";
pub const RELAY_SERVER_REGISTERED_EVENT: &str =
	"RelayServerRegistered(address,uint256,uint256,string)";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
	#[error("ABI decoding failed: {0}")]
	Abi(#[from] ethabi::Error),
	#[error("invalid address {0:?}")]
	InvalidAddress(String),
	#[error("value does not fit the target integer")]
	Overflow,
	#[error("missing topic {0}")]
	MissingTopic(usize),
	#[error("unrecognized event topic {0:#x}")]
	UnknownEvent(H256),
	#[error("unexpected token at position {0}")]
	Layout(usize),
	#[error("log without {0}")]
	Incomplete(&'static str),
}

/// Topic0 for an event signature.
pub fn event_topic(signature: &str) -> H256 {
	H256::from(keccak256(signature.as_bytes()))
}

/// Left-pad an address into an indexed topic.
pub fn address_topic(address: Address) -> H256 {
	H256::from(address)
}

/// Decode the indexed address at `position`.
pub fn topic_address(topics: &[H256], position: usize) -> Result<Address, DecodeError> {
	topics
		.get(position)
		.map(|topic| Address::from(*topic))
		.ok_or(DecodeError::MissingTopic(position))
}

/// Parse a configured address; case and `0x` prefix do not matter.
pub fn parse_address(raw: &str) -> Result<Address, DecodeError> {
	raw.trim()
		.parse::<Address>()
		.map_err(|_| DecodeError::InvalidAddress(raw.to_string()))
}

/// Lowercase, `0x` prefixed form used for addresses stored in wallet entries.
pub fn format_address(address: &Address) -> String {
	format!("{address:#x}")
}

pub fn format_hash(hash: &H256) -> String {
	format!("{hash:#x}")
}

pub fn to_u128(value: U256) -> Result<u128, DecodeError> {
	if value > U256::from(u128::MAX) {
		return Err(DecodeError::Overflow);
	}
	Ok(value.as_u128())
}

pub fn to_u64(value: U256) -> Result<u64, DecodeError> {
	if value > U256::from(u64::MAX) {
		return Err(DecodeError::Overflow);
	}
	Ok(value.as_u64())
}

pub fn decode(types: &[ParamType], data: &[u8]) -> Result<Vec<Token>, DecodeError> {
	Ok(ethabi::decode(types, data)?)
}

fn token_at(tokens: &[Token], index: usize) -> Result<&Token, DecodeError> {
	tokens.get(index).ok_or(DecodeError::Layout(index))
}

pub fn uint_at(tokens: &[Token], index: usize) -> Result<U256, DecodeError> {
	match token_at(tokens, index)? {
		Token::Uint(value) => Ok(*value),
		_ => Err(DecodeError::Layout(index)),
	}
}

pub fn address_at(tokens: &[Token], index: usize) -> Result<Address, DecodeError> {
	match token_at(tokens, index)? {
		Token::Address(address) => Ok(*address),
		_ => Err(DecodeError::Layout(index)),
	}
}

pub fn bytes32_at(tokens: &[Token], index: usize) -> Result<H256, DecodeError> {
	match token_at(tokens, index)? {
		Token::FixedBytes(bytes) if bytes.len() == 32 => Ok(H256::from_slice(bytes)),
		_ => Err(DecodeError::Layout(index)),
	}
}

pub fn string_at(tokens: &[Token], index: usize) -> Result<String, DecodeError> {
	match token_at(tokens, index)? {
		Token::String(value) => Ok(value.clone()),
		_ => Err(DecodeError::Layout(index)),
	}
}

/// `eth_call` payload for a function taking address arguments only.
pub fn address_call(signature: &str, args: &[Address]) -> Bytes {
	let tokens: Vec<Token> = args.iter().copied().map(Token::Address).collect();
	[id(signature).as_slice(), ethabi::encode(&tokens).as_slice()]
		.concat()
		.into()
}

/// Whether the upper 128 bits of an allowance are all set, i.e. it started as a max approval.
pub fn is_max_approval(allowance: U256) -> bool {
	allowance >> 128usize == U256::from(u128::MAX)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn transfer_topic_matches_known_hash() {
		assert_eq!(
			format_hash(&event_topic(TRANSFER_EVENT)),
			"0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
		);
	}

	#[test]
	fn erc20_call_data_starts_with_selector() {
		let owner = Address::repeat_byte(0x11);
		let call = address_call("balanceOf(address)", &[owner]);
		assert_eq!(&call[..4], &[0x70, 0xa0, 0x82, 0x31]);
		assert_eq!(call.len(), 36);
		assert_eq!(&call[16..], owner.as_bytes());

		let allowance = address_call("allowance(address,address)", &[owner, owner]);
		assert_eq!(&allowance[..4], &[0xdd, 0x62, 0xed, 0x3e]);
		assert_eq!(allowance.len(), 68);
	}

	#[test]
	fn address_topic_round_trips_through_topic_decoder() {
		let address = parse_address("0xAbCdEf0123456789aBcDeF0123456789AbCdEf01").unwrap();
		let topics = [H256::zero(), address_topic(address)];
		assert_eq!(topic_address(&topics, 1).unwrap(), address);
		assert_eq!(
			format_address(&address),
			"0xabcdef0123456789abcdef0123456789abcdef01"
		);
		assert!(matches!(topic_address(&topics, 2), Err(DecodeError::MissingTopic(2))));
	}

	#[test]
	fn malformed_addresses_are_rejected() {
		assert!(parse_address("0xpool").is_err());
		assert!(parse_address("").is_err());
	}

	#[test]
	fn narrowing_rejects_high_bits() {
		assert_eq!(to_u128(U256::from(7u64)).unwrap(), 7);
		assert!(matches!(to_u128(U256::MAX), Err(DecodeError::Overflow)));
		assert!(matches!(to_u64(U256::from(u128::MAX)), Err(DecodeError::Overflow)));
	}

	#[test]
	fn decodes_dynamic_string() {
		let data = ethabi::encode(&[Token::Uint(U256::from(3u64)), Token::String("hello".into())]);
		let tokens = decode(&[ParamType::Uint(256), ParamType::String], &data).unwrap();
		assert_eq!(uint_at(&tokens, 0).unwrap(), U256::from(3u64));
		assert_eq!(string_at(&tokens, 1).unwrap(), "hello");
		assert!(matches!(string_at(&tokens, 0), Err(DecodeError::Layout(0))));
	}

	#[test]
	fn truncated_data_is_an_error() {
		assert!(matches!(
			decode(&[ParamType::Uint(256)], &[0u8; 16]),
			Err(DecodeError::Abi(_))
		));
	}

	#[test]
	fn max_approval_is_recognized_by_its_upper_half() {
		assert!(is_max_approval(U256::MAX));
		assert!(is_max_approval(U256::MAX - U256::from(330u64)));
		assert!(!is_max_approval(U256::from(5_000u64)));
	}
}
