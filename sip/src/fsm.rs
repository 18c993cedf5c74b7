use anyhow::{Error, Result};
use strum_macros;
use strum_macros::EnumString;
use thiserror::Error;

use super::transaction::{TransactionKey, TransactionManager, TransactionType};
use crate::message::Method;

#[derive(Debug, Error)]
pub enum FsmError {
    #[error("invalid state")]
    InvalidState,
    #[error("invalid input")]
    InvalidInput,
}

#[derive(Debug, PartialEq, Eq, Clone, strum_macros::Display)]
pub enum Input {
    No,

    Req,
    Ack,
    Resp1xx,
    Resp2xx,
    Resp300to699,

    TimerA,
    TimerB,
    TimerD,

    TimerE,
    TimerF,
    TimerK,

    TimerG,
    TimerH,
    TimerI,
    TimerJ,

    TransportError,
}

#[derive(strum_macros::Display, EnumString, Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    Trying,
    Calling,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Drive one transaction through the machine until it settles. Actions run
/// inside the per-state handlers; a handler can chain by returning a
/// follow-up input. Entering Terminated destroys the transaction, which is
/// also what cancels its outstanding timers.
pub async fn spin(
    mgr: &mut TransactionManager,
    key: &TransactionKey,
    input: Input,
) -> Result<(), Error> {
    let mut input = input;
    loop {
        let state = mgr.state(key)?;
        let (new_state, next) = match &key.method {
            &Method::INVITE => match key.tx_type {
                TransactionType::Server => {
                    InviteServer::action(mgr, key, &state, &input).await
                }
                TransactionType::Client => {
                    InviteClient::action(mgr, key, &state, &input).await
                }
            },
            _ => match key.tx_type {
                TransactionType::Server => {
                    NonInviteServer::action(mgr, key, &state, &input).await
                }
                TransactionType::Client => {
                    NonInviteClient::action(mgr, key, &state, &input).await
                }
            },
        }?;
        if new_state == State::Terminated {
            mgr.remove(key);
            return Ok(());
        }
        mgr.set_state(key, new_state)?;
        if next == Input::No {
            break;
        }
        input = next;
    }

    Ok(())
}

fn no_action() -> Input {
    Input::No
}

async fn client_passup(mgr: &mut TransactionManager, key: &TransactionKey) -> Input {
    mgr.passup(key);
    Input::No
}

fn timeout(mgr: &mut TransactionManager, key: &TransactionKey) -> Input {
    mgr.note_timeout(key);
    Input::No
}

async fn server_respond(mgr: &mut TransactionManager, key: &TransactionKey) -> Input {
    let _ = mgr.reply_last(key).await;
    Input::No
}

//                  |INVITE sent
//                  V          Timer A: resend INVITE, doubling
//            +-----------+    Timer B or too many resends: timeout
//            |  Calling  |-------------------------------------+
//            +-----------+ 2xx: pass up, done                  |
//              |       |                                       |
//              |1xx    |300-699: pass up, send ACK             |
//              V       |                                       |
//        +-----------+ |                                       |
//        |Proceeding |-+  (2xx: pass up, done)                 |
//        +-----------+ |                                       |
//                      V                                       V
//                +-----------+  Timer D               +------------+
//                | Completed |------------------------| Terminated |
//                +-----------+  (300-699: resend ACK) +------------+
//
//                         INVITE client transaction
#[derive(Default, Debug)]
pub struct InviteClient;

impl InviteClient {
    pub async fn action(
        mgr: &mut TransactionManager,
        key: &TransactionKey,
        state: &State,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match state {
            State::Calling => Self::calling_act(mgr, key, input).await,
            State::Proceeding => Self::proceeding_act(mgr, key, input).await,
            State::Completed => Self::completed_act(mgr, key, input).await,
            _ => Err(FsmError::InvalidState)?,
        }
    }

    async fn calling_act(
        mgr: &mut TransactionManager,
        key: &TransactionKey,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            Input::Resp1xx => {
                Ok((State::Proceeding, client_passup(mgr, key).await))
            }
            Input::Resp2xx => {
                Ok((State::Terminated, client_passup(mgr, key).await))
            }
            Input::Resp300to699 => {
                Ok((State::Completed, Self::act_300(mgr, key).await))
            }
            Input::TimerA => {
                if mgr.resends_exhausted(key) {
                    Ok((State::Terminated, timeout(mgr, key)))
                } else {
                    Ok((
                        State::Calling,
                        Self::client_resend(mgr, key, Input::TimerA).await,
                    ))
                }
            }
            Input::TimerB => Ok((State::Terminated, timeout(mgr, key))),
            Input::TransportError => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn proceeding_act(
        mgr: &mut TransactionManager,
        key: &TransactionKey,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            Input::Resp1xx => {
                Ok((State::Proceeding, client_passup(mgr, key).await))
            }
            Input::Resp2xx => {
                Ok((State::Terminated, client_passup(mgr, key).await))
            }
            Input::Resp300to699 => {
                Ok((State::Completed, Self::act_300(mgr, key).await))
            }
            // Timer A is cancelled by not re-arming it here.
            Input::TimerA | Input::TimerB => Ok((State::Proceeding, no_action())),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn completed_act(
        mgr: &mut TransactionManager,
        key: &TransactionKey,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            // A retransmitted final response means our ACK was lost.
            Input::Resp300to699 => {
                Ok((State::Completed, Self::ack(mgr, key).await))
            }
            Input::TimerD => Ok((State::Terminated, no_action())),
            Input::TimerA | Input::TimerB => Ok((State::Completed, no_action())),
            Input::TransportError => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn client_resend(
        mgr: &mut TransactionManager,
        key: &TransactionKey,
        rearm: Input,
    ) -> Input {
        let count = mgr.resend_request(key).await;
        mgr.register_timer(key, mgr.backoff(count), rearm);
        Input::No
    }

    async fn act_300(mgr: &mut TransactionManager, key: &TransactionKey) -> Input {
        client_passup(mgr, key).await;
        Self::ack(mgr, key).await;
        mgr.register_timer(key, TransactionManager::TIMER_D, Input::TimerD);
        Input::No
    }

    async fn ack(mgr: &mut TransactionManager, key: &TransactionKey) -> Input {
        let _ = mgr.send_ack(key).await;
        Input::No
    }
}

//                  |INVITE received, passed up
//                  V
//            +-----------+ INVITE: replay response     1xx: send
//            |Proceeding |--------------------------------+
//            +-----------+                                |
//     2xx: send |       | 300-699: send, Timer G + H      |
//               |       V                                 |
//               | +-----------+  INVITE: replay, Timer G: resend
//               | | Completed |----+
//               | +-----------+    | ACK
//               |       |Timer H   V
//               |       |      +-----------+ Timer I
//               |       |      | Confirmed |-----+
//               |       V      +-----------+     |
//               |  +------------+                |
//               +->| Terminated |<---------------+
//                  +------------+
//
//                         INVITE server transaction
#[derive(Default, Debug)]
pub struct InviteServer;

impl InviteServer {
    pub async fn action(
        mgr: &mut TransactionManager,
        key: &TransactionKey,
        state: &State,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match state {
            State::Proceeding => Self::proceeding_act(mgr, key, input).await,
            State::Completed => Self::completed_act(mgr, key, input).await,
            State::Confirmed => Self::confirmed_act(mgr, key, input).await,
            _ => Err(FsmError::InvalidState)?,
        }
    }

    async fn proceeding_act(
        mgr: &mut TransactionManager,
        key: &TransactionKey,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            Input::Req => Ok((State::Proceeding, server_respond(mgr, key).await)),
            Input::Resp1xx => {
                Ok((State::Proceeding, server_respond(mgr, key).await))
            }
            Input::Resp2xx => {
                Ok((State::Terminated, server_respond(mgr, key).await))
            }
            Input::Resp300to699 => {
                Ok((State::Completed, Self::act_300(mgr, key).await))
            }
            Input::TransportError => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn completed_act(
        mgr: &mut TransactionManager,
        key: &TransactionKey,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            Input::Req => Ok((State::Completed, server_respond(mgr, key).await)),
            Input::TimerG => {
                if mgr.resends_exhausted(key) {
                    Ok((State::Terminated, timeout(mgr, key)))
                } else {
                    Ok((State::Completed, Self::resend_response(mgr, key).await))
                }
            }
            Input::Ack => {
                mgr.register_timer(key, TransactionManager::TIMER_I, Input::TimerI);
                Ok((State::Confirmed, no_action()))
            }
            Input::TimerH => Ok((State::Terminated, timeout(mgr, key))),
            Input::TransportError => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn confirmed_act(
        mgr: &mut TransactionManager,
        key: &TransactionKey,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            // Absorb ACK retransmissions until Timer I reaps the state.
            Input::Ack | Input::TimerG | Input::TimerH => {
                Ok((State::Confirmed, no_action()))
            }
            Input::TimerI => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn act_300(mgr: &mut TransactionManager, key: &TransactionKey) -> Input {
        let _ = mgr.reply_last(key).await;
        mgr.register_timer(key, TransactionManager::T1, Input::TimerG);
        mgr.register_timer(key, TransactionManager::TIMER_H, Input::TimerH);
        Input::No
    }

    async fn resend_response(
        mgr: &mut TransactionManager,
        key: &TransactionKey,
    ) -> Input {
        let _ = mgr.reply_last(key).await;
        let count = mgr.bump_resend_count(key);
        mgr.register_timer(key, mgr.backoff(count), Input::TimerG);
        Input::No
    }
}

//                  |request sent
//                  V          Timer E: resend, doubling
//            +-----------+    Timer F or too many resends: timeout
//            |  Trying   |-------------------------------------+
//            +-----------+                                     |
//              |1xx    |200-699: pass up, Timer K              |
//              V       |                                       |
//        +-----------+ |                                       |
//        |Proceeding |-+  (200-699: pass up, Timer K)          |
//        +-----------+                                         |
//                      |                                       V
//                +-----------+  Timer K              +------------+
//                | Completed |---------------------->| Terminated |
//                +-----------+                       +------------+
//
//                        non-INVITE client transaction
#[derive(Default, Debug)]
pub struct NonInviteClient;

impl NonInviteClient {
    pub async fn action(
        mgr: &mut TransactionManager,
        key: &TransactionKey,
        state: &State,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match state {
            State::Trying => Self::trying_act(mgr, key, input).await,
            State::Proceeding => Self::proceeding_act(mgr, key, input).await,
            State::Completed => Self::completed_act(input),
            _ => Err(FsmError::InvalidState)?,
        }
    }

    async fn trying_act(
        mgr: &mut TransactionManager,
        key: &TransactionKey,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            Input::TimerE => {
                if mgr.resends_exhausted(key) {
                    Ok((State::Terminated, timeout(mgr, key)))
                } else {
                    Ok((State::Trying, Self::resend(mgr, key).await))
                }
            }
            Input::Resp1xx => {
                Ok((State::Proceeding, client_passup(mgr, key).await))
            }
            Input::Resp2xx | Input::Resp300to699 => {
                Ok((State::Completed, Self::act_final(mgr, key).await))
            }
            Input::TimerF => Ok((State::Terminated, timeout(mgr, key))),
            Input::TransportError => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn proceeding_act(
        mgr: &mut TransactionManager,
        key: &TransactionKey,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            Input::TimerE => {
                if mgr.resends_exhausted(key) {
                    Ok((State::Terminated, timeout(mgr, key)))
                } else {
                    Ok((State::Proceeding, Self::resend(mgr, key).await))
                }
            }
            Input::Resp1xx => {
                Ok((State::Proceeding, client_passup(mgr, key).await))
            }
            Input::Resp2xx | Input::Resp300to699 => {
                Ok((State::Completed, Self::act_final(mgr, key).await))
            }
            Input::TimerF => Ok((State::Terminated, timeout(mgr, key))),
            Input::TransportError => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    fn completed_act(input: &Input) -> Result<(State, Input), Error> {
        match input {
            Input::TimerK => Ok((State::Terminated, no_action())),
            Input::TimerE | Input::TimerF => Ok((State::Completed, no_action())),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn resend(mgr: &mut TransactionManager, key: &TransactionKey) -> Input {
        let count = mgr.resend_request(key).await;
        mgr.register_timer(key, mgr.backoff(count), Input::TimerE);
        Input::No
    }

    async fn act_final(mgr: &mut TransactionManager, key: &TransactionKey) -> Input {
        client_passup(mgr, key).await;
        mgr.register_timer(key, TransactionManager::TIMER_K, Input::TimerK);
        Input::No
    }
}

//                  |request received, passed up
//                  V
//            +-----------+
//            |  Trying   |--------------+
//            +-----------+              | 200-699: send, Timer J
//              |1xx: send               |
//              V                        |
//        +-----------+  request: replay |
//        |Proceeding |---+              |
//        +-----------+   |              |
//              |200-699: send, Timer J  |
//              V                        |
//        +-----------+  Timer J   +------------+
//        | Completed |----------->| Terminated |
//        +-----------+  (request: replay)
//
//                        non-INVITE server transaction
#[derive(Default, Debug)]
pub struct NonInviteServer;

impl NonInviteServer {
    pub async fn action(
        mgr: &mut TransactionManager,
        key: &TransactionKey,
        state: &State,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match state {
            State::Trying => Self::trying_act(mgr, key, input).await,
            State::Proceeding => Self::proceeding_act(mgr, key, input).await,
            State::Completed => Self::completed_act(mgr, key, input).await,
            _ => Err(FsmError::InvalidState)?,
        }
    }

    async fn trying_act(
        mgr: &mut TransactionManager,
        key: &TransactionKey,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            // Nothing to replay yet for a retransmitted request.
            Input::Req => Ok((State::Trying, no_action())),
            Input::Resp1xx => {
                Ok((State::Proceeding, server_respond(mgr, key).await))
            }
            Input::Resp2xx | Input::Resp300to699 => {
                Ok((State::Completed, Self::act_final(mgr, key).await))
            }
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn proceeding_act(
        mgr: &mut TransactionManager,
        key: &TransactionKey,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            Input::Req => Ok((State::Proceeding, server_respond(mgr, key).await)),
            Input::Resp1xx => {
                Ok((State::Proceeding, server_respond(mgr, key).await))
            }
            Input::Resp2xx | Input::Resp300to699 => {
                Ok((State::Completed, Self::act_final(mgr, key).await))
            }
            Input::TransportError => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn completed_act(
        mgr: &mut TransactionManager,
        key: &TransactionKey,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            Input::Req => Ok((State::Completed, server_respond(mgr, key).await)),
            Input::TimerJ => Ok((State::Terminated, no_action())),
            Input::TransportError => Ok((State::Terminated, no_action())),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn act_final(mgr: &mut TransactionManager, key: &TransactionKey) -> Input {
        let _ = mgr.reply_last(key).await;
        mgr.register_timer(key, TransactionManager::TIMER_J, Input::TimerJ);
        Input::No
    }
}
