use super::error::Error;
use super::options::Options;
use super::{ErrorCode, OpCode};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// An RRQ or WRQ, as parsed off the wire or built for sending.
#[derive(Debug)]
pub struct Request {
    op_code: OpCode,
    filename: String,
    mode: String,
    options: Options,
}

impl Request {
    pub fn rrq(filename: &str, mode: &str, options: &Options) -> Request {
        Request {
            op_code: OpCode::Rrq,
            filename: filename.to_string(),
            mode: mode.to_string(),
            options: options.clone(),
        }
    }

    pub fn wrq(filename: &str, mode: &str, options: &Options) -> Request {
        Request {
            op_code: OpCode::Wrq,
            filename: filename.to_string(),
            mode: mode.to_string(),
            options: options.clone(),
        }
    }

    pub fn op_code(&self) -> OpCode {
        self.op_code
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Transfer mode exactly as requested; validity is the dispatcher's
    /// call, so that its rejection can echo the original spelling.
    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn options(&self) -> &Options {
        &self.options
    }
}

fn take_cstr(buf: &mut Bytes) -> Option<Bytes> {
    let pos = buf.iter().position(|&b| b == 0)?;
    let s = buf.split_to(pos);
    buf.advance(1);
    Some(s)
}

pub fn parse_opcode(buf: &mut Bytes) -> Result<OpCode, Error> {
    if buf.len() < 2 {
        return Err(Error::PayloadDecode);
    }

    OpCode::try_from(buf.get_u16())
}

pub fn parse_request(buf: &mut Bytes) -> Result<Request, Error> {
    let op_code = parse_opcode(buf)?;
    if !matches!(op_code, OpCode::Rrq | OpCode::Wrq) {
        return Err(Error::InvalidOpCode);
    }

    let filename = take_cstr(buf).ok_or(Error::PayloadDecode)?;
    let filename = String::from_utf8(filename.to_vec())?;

    let mode = take_cstr(buf).ok_or(Error::PayloadDecode)?;
    let mode = String::from_utf8(mode.to_vec())?;

    let options = Options::parse(buf.as_ref());

    Ok(Request {
        op_code,
        filename,
        mode,
        options,
    })
}

pub fn parse_data(buf: &mut Bytes) -> Result<(u16, Bytes), Error> {
    if buf.len() < 2 {
        return Err(Error::PayloadDecode);
    }

    let blocknum = buf.get_u16();
    Ok((blocknum, buf.clone()))
}

pub fn parse_ack(buf: &mut Bytes) -> Result<u16, Error> {
    if buf.len() != 2 {
        return Err(Error::PayloadDecode);
    }

    Ok(buf.get_u16())
}

pub fn parse_error(buf: &mut Bytes) -> Result<(ErrorCode, String), Error> {
    if buf.len() < 2 {
        return Err(Error::PayloadDecode);
    }

    let code = ErrorCode::try_from(buf.get_u16())?;

    let message = match buf.iter().position(|&b| b == 0) {
        Some(pos) => buf.split_to(pos),
        _ => buf.clone(),
    };
    let message = String::from_utf8(message.to_vec())?;

    if message.is_empty() {
        Ok((code, code.message().to_string()))
    } else {
        Ok((code, message))
    }
}

pub fn parse_oack(buf: &mut Bytes) -> Result<Options, Error> {
    Ok(Options::parse(buf.as_ref()))
}

pub fn request(req: &Request) -> Bytes {
    let mut bytes = BytesMut::new();
    bytes.put_u16(req.op_code() as u16);
    bytes.put(req.filename().as_bytes());
    bytes.put_u8(0);
    bytes.put(req.mode().as_bytes());
    bytes.put_u8(0);
    bytes.put(req.options().as_bytes());
    bytes.freeze()
}

pub fn data(blocknum: u16, payload: &[u8]) -> Bytes {
    let mut bytes = BytesMut::with_capacity(super::HEADER_LEN + payload.len());
    bytes.put_u16(OpCode::Data as u16);
    bytes.put_u16(blocknum);
    bytes.put(payload);
    bytes.freeze()
}

pub fn ack(blocknum: u16) -> Bytes {
    let mut bytes = BytesMut::new();
    bytes.put_u16(OpCode::Ack as u16);
    bytes.put_u16(blocknum);
    bytes.freeze()
}

pub fn error(code: ErrorCode, message: &str) -> Bytes {
    let mut bytes = BytesMut::new();
    bytes.put_u16(OpCode::Error as u16);
    bytes.put_u16(code as u16);
    bytes.put(message.as_bytes());
    bytes.put_u8(0);
    bytes.freeze()
}

pub fn error_from_code(code: ErrorCode) -> Bytes {
    error(code, code.message())
}

pub fn oack(options: &Options) -> Bytes {
    let mut bytes = BytesMut::new();
    bytes.put_u16(OpCode::Oack as u16);
    bytes.put(options.as_bytes());
    bytes.freeze()
}

#[cfg(test)]
mod tests {
    use super::super::error;
    use super::*;

    #[test]
    fn parse_request_roundtrip() -> Result<(), error::Error> {
        let mut options = Options::new();
        options.set("BlkSize", "1428".to_string());
        options.set("timeout", "3".to_string());

        let req = Request::rrq("subdir/firmware.bin", "octet", &options);
        let mut wire = request(&req);

        let ret = parse_request(&mut wire)?;
        assert_eq!(OpCode::Rrq, ret.op_code());
        assert_eq!("subdir/firmware.bin", ret.filename());
        assert_eq!("octet", ret.mode());
        assert_eq!(&options, ret.options());
        Ok(())
    }

    #[test]
    fn parse_request_missing_mode() {
        let mut wire = Bytes::from(&[0, 2, b'a', 0][..]);
        let ret = parse_request(&mut wire);
        assert!(matches!(ret, Err(error::Error::PayloadDecode)));
    }

    #[test]
    fn parse_request_wrong_opcode() {
        let mut wire = Bytes::from(&[0, 3, 0, 1, b'x'][..]);
        let ret = parse_request(&mut wire);
        assert!(matches!(ret, Err(error::Error::InvalidOpCode)));
    }

    #[test]
    fn parse_data_roundtrip() -> Result<(), error::Error> {
        let mut wire = data(7, b"abc");
        parse_opcode(&mut wire)?;
        let (blocknum, payload) = parse_data(&mut wire)?;
        assert_eq!(7, blocknum);
        assert_eq!(&b"abc"[..], payload.as_ref());
        Ok(())
    }

    #[test]
    fn parse_data_empty_payload() -> Result<(), error::Error> {
        let mut wire = data(1, b"");
        parse_opcode(&mut wire)?;
        let (blocknum, payload) = parse_data(&mut wire)?;
        assert_eq!(1, blocknum);
        assert!(payload.is_empty());
        Ok(())
    }

    #[test]
    fn parse_ack_roundtrip() -> Result<(), error::Error> {
        let mut wire = ack(65535);
        parse_opcode(&mut wire)?;
        assert_eq!(65535, parse_ack(&mut wire)?);
        Ok(())
    }

    #[test]
    fn parse_ack_trailing_junk() {
        let mut wire = Bytes::from(&[0, 4, 0, 1, 9][..]);
        parse_opcode(&mut wire).unwrap();
        assert!(parse_ack(&mut wire).is_err());
    }

    #[test]
    fn parse_error_roundtrip() -> Result<(), error::Error> {
        let mut wire = error(ErrorCode::DiskFull, "out of space");
        parse_opcode(&mut wire)?;
        let (code, message) = parse_error(&mut wire)?;
        assert_eq!(ErrorCode::DiskFull, code);
        assert_eq!("out of space", message);
        Ok(())
    }

    #[test]
    fn parse_error_default_message() -> Result<(), error::Error> {
        let mut wire = error(ErrorCode::FileNotFound, "");
        parse_opcode(&mut wire)?;
        let (code, message) = parse_error(&mut wire)?;
        assert_eq!(ErrorCode::FileNotFound, code);
        assert_eq!("File not found", message);
        Ok(())
    }

    #[test]
    fn parse_error_unknown_code() {
        let mut wire = Bytes::from(&[0, 5, 0, 9, b'x', 0][..]);
        parse_opcode(&mut wire).unwrap();
        let ret = parse_error(&mut wire);
        assert!(matches!(ret, Err(error::Error::InvalidErrorCode(9))));
    }

    #[test]
    fn parse_oack_roundtrip() -> Result<(), error::Error> {
        let mut options = Options::new();
        options.set("blksize", "8".to_string());
        let mut wire = oack(&options);
        parse_opcode(&mut wire)?;
        assert_eq!(options, parse_oack(&mut wire)?);
        Ok(())
    }

    #[test]
    fn option_order_preserved() -> Result<(), error::Error> {
        let mut options = Options::new();
        options.set("timeout", "4".to_string());
        options.set("blksize", "512".to_string());

        let mut wire = oack(&options);
        parse_opcode(&mut wire)?;
        let ret = parse_oack(&mut wire)?;
        let names: Vec<&str> = ret.iter().map(|(name, _)| name).collect();
        assert_eq!(vec!["timeout", "blksize"], names);
        Ok(())
    }
}
