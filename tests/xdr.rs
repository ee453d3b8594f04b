use std::fmt::Debug;
use std::io::Cursor;

use nfs_mamont_rpc::xdr::rpc::{
    accept_body, auth_flavor, auth_stat, auth_unix, call_message, mismatch_info, opaque_auth,
    rpc_body, rpc_msg, MAX_AUTH_BYTES, RPC_VERSION,
};
use nfs_mamont_rpc::xdr::{deserialize, mount, nfs3, Deserialize, Serialize};

#[derive(Default)]
struct Context {
    buf: Vec<u8>,
}

trait TestValue: Deserialize + Serialize + Eq + Default + Debug + Clone {}
impl<T: Deserialize + Serialize + Eq + Default + Debug + Clone> TestValue for T {}

impl Context {
    /// Encodes after `existing` bytes of junk and checks alignment and decoding.
    fn check<T: TestValue>(&mut self, src_value: &T) {
        for existing in 0..8 {
            self.buf = vec![0xAA; existing];

            src_value.serialize(&mut self.buf).expect("cannot serialize");
            assert_eq!((self.buf.len() - existing) % 4, 0);

            let result_value =
                deserialize::<T>(&mut &self.buf[existing..]).expect("cannot deserialize");
            assert_eq!(src_value, &result_value);
        }
    }

    fn check_multi<T: TestValue>(&mut self, src_values: &[T]) {
        src_values.iter().for_each(|i| self.check(i));
    }
}

#[test]
fn test_primitives() {
    let mut context = Context::default();
    context.check_multi(&[0_u32, 1, 0x7fff_ffff, u32::MAX]);
    context.check_multi(&[0_i32, -1, i32::MIN, i32::MAX]);
    context.check_multi(&[true, false]);
}

#[test]
fn test_opaque_and_arrays() {
    let mut context = Context::default();
    context.check_multi(&[vec![], vec![1_u8], vec![1, 2, 3], vec![1, 2, 3, 4], vec![9; 13]]);
    context.check_multi(&[Vec::<u32>::new(), vec![7], vec![1, 2, 3, 4, 5]]);
}

#[test]
fn test_auth_structures() {
    let mut context = Context::default();
    context.check(&opaque_auth::default());
    context.check(&opaque_auth { flavor: auth_flavor::AUTH_UNIX, body: vec![1, 2, 3] });
    context.check(&auth_unix {
        stamp: 5,
        machinename: b"box".to_vec(),
        uid: 1,
        gid: 2,
        gids: vec![3, 4],
    });
    context.check(&mismatch_info { low: 2, high: 3 });
}

#[test]
fn opaque_is_length_prefixed_and_padded() {
    let mut buf = Vec::new();
    vec![0xde_u8, 0xad, 0xbe].serialize(&mut buf).expect("serialize");
    assert_eq!(buf, vec![0, 0, 0, 3, 0xde, 0xad, 0xbe, 0]);
}

#[test]
fn truncated_input_is_an_error() {
    let err = deserialize::<Vec<u8>>(&mut &[0_u8, 0, 0, 8, 1, 2][..]).expect_err("truncated");
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
}

#[test]
fn declared_length_is_not_trusted() {
    let mut src: &[u8] = &[0xff, 0xff, 0xff, 0xf0, 1, 2, 3, 4];
    let err = deserialize::<Vec<u8>>(&mut src).expect_err("length past the input");
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);

    let mut src: &[u8] = &[0xff, 0xff, 0xff, 0xf0, 0, 0, 0, 1];
    let err = deserialize::<Vec<u32>>(&mut src).expect_err("count past the input");
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
}

#[test]
fn opaque_auth_body_is_bounded() {
    let mut buf = vec![0, 0, 0, 1, 0, 0, 0x01, 0x91];
    buf.resize(8 + 404, 0);
    let err = deserialize::<opaque_auth>(&mut &buf[..]).expect_err("401 byte body");
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

    let largest = opaque_auth { flavor: auth_flavor::AUTH_UNIX, body: vec![5; MAX_AUTH_BYTES] };
    Context::default().check(&largest);
}

#[test]
fn unknown_enum_value_is_invalid_data() {
    let err = deserialize::<auth_stat>(&mut &[0_u8, 0, 0, 99][..]).expect_err("bad status");
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[test]
fn call_header_layout() {
    let cred = opaque_auth { flavor: auth_flavor::AUTH_UNIX, body: vec![0; 8] };
    let msg = call_message(0x11223344, nfs3::PROGRAM, nfs3::VERSION, nfs3::NFSProgram::NFSPROC3_GETATTR.into(), cred);
    let mut buf = Vec::new();
    msg.serialize(&mut buf).expect("serialize");

    #[rustfmt::skip]
    let head: Vec<u8> = vec![
        0x11, 0x22, 0x33, 0x44, // xid
        0, 0, 0, 0,             // CALL
        0, 0, 0, 2,             // rpcvers
        0, 1, 0x86, 0xa3,       // 100003
        0, 0, 0, 3,             // version
        0, 0, 0, 1,             // GETATTR
        0, 0, 0, 1,             // AUTH_UNIX
        0, 0, 0, 8,
    ];
    assert_eq!(&buf[..head.len()], &head[..]);
    // credential body, then an empty AUTH_NULL verifier
    assert_eq!(&buf[head.len() + 8..], &[0, 0, 0, 0, 0, 0, 0, 0]);

    let decoded: rpc_msg = deserialize(&mut Cursor::new(&buf)).expect("decode");
    match decoded.body {
        rpc_body::CALL(call) => {
            assert_eq!(call.rpcvers, RPC_VERSION);
            assert_eq!(call.prog, nfs3::PROGRAM);
            assert_eq!(call.proc, 1);
        }
        rpc_body::REPLY(_) => panic!("expected a call"),
    }
}

#[test]
fn accept_body_carries_mismatch_range() {
    let mut buf = Vec::new();
    accept_body::PROG_MISMATCH(mismatch_info { low: 1, high: 3 })
        .serialize(&mut buf)
        .expect("serialize");
    assert_eq!(buf, vec![0, 0, 0, 2, 0, 0, 0, 1, 0, 0, 0, 3]);
}

#[test]
fn program_numbers() {
    assert_eq!(nfs3::PROGRAM, 100003);
    assert_eq!(mount::PROGRAM, 100005);
    assert_eq!(u32::from(nfs3::NFSProgram::NFSPROC3_COMMIT), 21);
    assert_eq!(u32::from(mount::MountProgram::MOUNTPROC3_EXPORT), 5);
}
