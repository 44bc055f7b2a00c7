use bytes::{Buf, BufMut, BytesMut};
use sha1::{Digest, Sha1};

use super::packet::{capabilities::*, Packet};

/// MySQL initial handshake packet (server -> client)
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data_part1: [u8; 8],
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_data_part2: Vec<u8>,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Create a new handshake packet for the proxy listener side.
    ///
    /// The advertised version must be >= 10.0 so MariaDB clients enable the
    /// features the router depends on (GTID session tracking in particular).
    pub fn new(connection_id: u32) -> Self {
        let mut auth_data1 = [0u8; 8];
        let mut auth_data2 = vec![0u8; 12];

        use rand::RngCore;
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut auth_data1);
        rng.fill_bytes(&mut auth_data2);

        Self {
            protocol_version: 10,
            server_version: "10.6.0-hermes".to_string(),
            connection_id,
            auth_plugin_data_part1: auth_data1,
            capability_flags: DEFAULT_CAPABILITIES,
            character_set: 0x21, // utf8_general_ci
            status_flags: 0x0002,
            auth_plugin_data_part2: auth_data2,
            auth_plugin_name: "mysql_native_password".to_string(),
        }
    }

    /// Get full auth plugin data (20 bytes)
    pub fn auth_plugin_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(20);
        data.extend_from_slice(&self.auth_plugin_data_part1);
        data.extend_from_slice(&self.auth_plugin_data_part2);
        data
    }

    /// Numeric server version (major * 10000 + minor * 100 + patch)
    pub fn server_version_num(&self) -> u32 {
        let mut parts = self.server_version.split(['.', '-']);
        let mut num = 0u32;
        for mult in [10_000u32, 100, 1] {
            let part: u32 = parts
                .next()
                .and_then(|p| p.parse().ok())
                .unwrap_or_default();
            num += part * mult;
        }
        num
    }

    /// Encode to packet
    pub fn encode(&self) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(self.protocol_version);

        // Server version (null-terminated)
        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);

        buf.put_u32_le(self.connection_id);

        // Auth plugin data part 1 (8 bytes) + filler
        buf.extend_from_slice(&self.auth_plugin_data_part1);
        buf.put_u8(0);

        // Capability flags (lower 2 bytes)
        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);

        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);

        // Capability flags (upper 2 bytes)
        buf.put_u16_le(((self.capability_flags >> 16) & 0xFFFF) as u16);

        // Auth plugin data length
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.put_u8(
                (self.auth_plugin_data_part1.len() + self.auth_plugin_data_part2.len() + 1) as u8,
            );
        } else {
            buf.put_u8(0);
        }

        // Reserved (10 bytes)
        buf.extend_from_slice(&[0u8; 10]);

        // Auth plugin data part 2
        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.extend_from_slice(&self.auth_plugin_data_part2);
            buf.put_u8(0);
        }

        // Auth plugin name
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(0, buf.freeze())
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let protocol_version = buf.get_u8();

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let server_version = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        let connection_id = buf.get_u32_le();

        let mut auth_plugin_data_part1 = [0u8; 8];
        auth_plugin_data_part1.copy_from_slice(&buf[..8]);
        buf.advance(8);

        // Filler
        buf.advance(1);

        let capability_flags_lower = buf.get_u16_le() as u32;
        let character_set = buf.get_u8();
        let status_flags = buf.get_u16_le();
        let capability_flags_upper = buf.get_u16_le() as u32;
        let capability_flags = capability_flags_lower | (capability_flags_upper << 16);

        let auth_plugin_data_len = buf.get_u8();

        // Reserved
        buf.advance(10);

        let mut auth_plugin_data_part2 = Vec::new();
        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = std::cmp::max(13, auth_plugin_data_len as usize - 8);
            let data_len = buf.iter().take(len).position(|&b| b == 0).unwrap_or(len);
            auth_plugin_data_part2.extend_from_slice(&buf[..data_len]);
            buf.advance(len);
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            "mysql_native_password".to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data_part1,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data_part2,
            auth_plugin_name,
        })
    }
}

/// MySQL handshake response packet (client -> server)
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
}

impl HandshakeResponse {
    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let capability_flags = buf.get_u32_le();
        let max_packet_size = buf.get_u32_le();
        let character_set = buf.get_u8();

        // Reserved (23 bytes)
        buf.advance(23);

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let username = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        let auth_response = if capability_flags
            & (CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA | CLIENT_SECURE_CONNECTION)
            != 0
        {
            let len = buf.get_u8() as usize;
            let data = buf[..len].to_vec();
            buf.advance(len);
            data
        } else {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let data = buf[..null_pos].to_vec();
            buf.advance((null_pos + 1).min(buf.len()));
            data
        };

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let db = String::from_utf8_lossy(&buf[..null_pos]).to_string();
            buf.advance((null_pos + 1).min(buf.len()));
            if db.is_empty() {
                None
            } else {
                Some(db)
            }
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            "mysql_native_password".to_string()
        };

        Some(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
        })
    }

    /// Encode to packet
    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);

        // Reserved (23 bytes)
        buf.extend_from_slice(&[0u8; 23]);

        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        // Auth response (length-prefixed)
        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(ref db) = self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// Compute mysql_native_password auth response
pub fn compute_auth_response(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // SHA1(password)
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let hash1 = hasher.finalize();

    // SHA1(SHA1(password))
    let mut hasher = Sha1::new();
    hasher.update(hash1);
    let hash2 = hasher.finalize();

    // SHA1(auth_data + SHA1(SHA1(password)))
    let mut hasher = Sha1::new();
    hasher.update(auth_data);
    hasher.update(hash2);
    let hash3 = hasher.finalize();

    // XOR SHA1(password) with SHA1(auth_data + SHA1(SHA1(password)))
    hash1
        .iter()
        .zip(hash3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_roundtrip() {
        let handshake = InitialHandshake::new(42);
        let packet = handshake.encode();

        let parsed = InitialHandshake::parse(&packet.payload).unwrap();
        assert_eq!(parsed.connection_id, 42);
        assert_eq!(parsed.server_version, handshake.server_version);
        assert_eq!(parsed.auth_plugin_data_part1, handshake.auth_plugin_data_part1);
        assert_eq!(parsed.auth_plugin_data_part2, handshake.auth_plugin_data_part2);
        assert_eq!(parsed.auth_plugin_name, "mysql_native_password");
    }

    #[test]
    fn test_response_roundtrip() {
        let response = HandshakeResponse {
            capability_flags: DEFAULT_CAPABILITIES,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: "app".to_string(),
            auth_response: vec![1, 2, 3, 4],
            database: Some("orders".to_string()),
            auth_plugin_name: "mysql_native_password".to_string(),
        };

        let packet = response.encode(1);
        let parsed = HandshakeResponse::parse(&packet.payload).unwrap();
        assert_eq!(parsed.username, "app");
        assert_eq!(parsed.auth_response, vec![1, 2, 3, 4]);
        assert_eq!(parsed.database.as_deref(), Some("orders"));
    }

    #[test]
    fn test_server_version_num() {
        let mut handshake = InitialHandshake::new(1);
        handshake.server_version = "10.6.12-MariaDB".to_string();
        assert_eq!(handshake.server_version_num(), 100612);
    }

    #[test]
    fn test_auth_response_empty_password() {
        assert!(compute_auth_response("", &[0; 20]).is_empty());
        assert_eq!(compute_auth_response("secret", &[0; 20]).len(), 20);
    }
}
