//! POSIX message queue IPC endpoint.
//!
//! No message-queue crate covers this, so it binds `mq_open`/`mq_send`/
//! `mq_timedreceive`/`mq_close` directly through `libc`.

use std::ffi::CString;
use std::io;

use crate::error::IpcError;

const MSG_SIZE_LIMIT: i64 = 3 << 20; // 3 MiB
const MAX_QUEUES: i64 = 10;
const MAX_MESSAGES: i64 = 3;

/// Raises `RLIMIT_MSGQUEUE` so up to [`MAX_QUEUES`] queues of depth
/// [`MAX_MESSAGES`] and message size [`MSG_SIZE_LIMIT`] fit comfortably,
/// with a `max_messages + 2` headroom factor.
pub fn raise_msgqueue_rlimit() -> Result<(), IpcError> {
    let limit = (MAX_QUEUES * (MAX_MESSAGES + 2) * MSG_SIZE_LIMIT) as u64;
    let rlim = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MSGQUEUE, &rlim) };
    if ret != 0 {
        return Err(IpcError::SetRlimit(nix::Error::last()));
    }
    Ok(())
}

pub enum QueueDirection {
    Send,
    Receive,
}

/// One POSIX message queue, opened for either sending or receiving.
pub struct IpcEndpoint {
    name: String,
    mqd: Option<libc::mqd_t>,
}

impl IpcEndpoint {
    /// Opens (creating with mode 0600 if absent) the named queue with depth
    /// `max_messages` and the fixed 3 MiB message size limit.
    pub fn open(name: &str, direction: QueueDirection, max_messages: i64) -> Result<Self, IpcError> {
        let cname = CString::new(name).expect("queue name must not contain NUL");

        let mut oflag = libc::O_CREAT
            | match direction {
                QueueDirection::Send => libc::O_WRONLY,
                QueueDirection::Receive => libc::O_RDONLY,
            };
        if matches!(direction, QueueDirection::Send) {
            oflag |= libc::O_NONBLOCK;
        }

        let attr = libc::mq_attr {
            mq_flags: 0,
            mq_maxmsg: max_messages,
            mq_msgsize: MSG_SIZE_LIMIT,
            mq_curmsgs: 0,
            #[cfg(target_env = "musl")]
            pad: Default::default(),
        };

        let mqd = unsafe { libc::mq_open(cname.as_ptr(), oflag, 0o600u32, &attr as *const libc::mq_attr) };
        if mqd == -1 {
            return Err(IpcError::Open {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            mqd: Some(mqd),
        })
    }

    fn mqd(&self) -> libc::mqd_t {
        self.mqd.expect("IpcEndpoint used after close()")
    }

    /// Non-blocking send. Returns `Ok(true)` on success, `Ok(false)` when the
    /// queue is full (no error logged by the caller), and `Err` only for
    /// "message too large", the one failure mode worth logging.
    pub fn send(&self, msg: &[u8]) -> Result<bool, IpcError> {
        let ret = unsafe {
            libc::mq_send(self.mqd(), msg.as_ptr() as *const libc::c_char, msg.len(), 0)
        };
        if ret == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(false),
            Some(libc::EMSGSIZE) => Err(IpcError::Open {
                name: self.name.clone(),
                source: err,
            }),
            _ => Ok(false),
        }
    }

    /// Blocks up to `timeout_secs`. Signal interruption and timeout both
    /// yield `Ok(None)`; callers can't distinguish the two.
    pub fn receive(&self, timeout_secs: i64) -> Result<Option<Vec<u8>>, IpcError> {
        let mut deadline = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline);
        }
        deadline.tv_sec += timeout_secs;

        let mut buf = vec![0u8; MSG_SIZE_LIMIT as usize];
        let mut prio: libc::c_uint = 0;
        let n = unsafe {
            libc::mq_timedreceive(
                self.mqd(),
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut prio,
                &deadline,
            )
        };

        if n >= 0 {
            buf.truncate(n as usize);
            return Ok(Some(buf));
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ETIMEDOUT) | Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
            _ => Err(IpcError::Receive {
                name: self.name.clone(),
                source: err,
            }),
        }
    }

    /// Releases the queue handle. Does not unlink the queue.
    pub fn close(mut self) -> Result<(), IpcError> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<(), IpcError> {
        let Some(mqd) = self.mqd.take() else {
            return Ok(());
        };
        let ret = unsafe { libc::mq_close(mqd) };
        if ret != 0 {
            return Err(IpcError::Close {
                name: self.name.clone(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl Drop for IpcEndpoint {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}
