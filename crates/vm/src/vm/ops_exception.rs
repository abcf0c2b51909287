//! Exception handling: handler registration, throwing, and unwinding.

use super::{Cursor, Flow, Vm};
use crate::error::{VmError, VmResult};
use crate::object::ExceptionHandler;
use crate::op_code::TryFlags;
use crate::value::Value;

impl Vm {
    pub(crate) fn op_try(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let depth = cur.read_byte() as usize;
        let flags = TryFlags::from_bits_truncate(cur.read_byte());
        let ex_jump = cur.read_short() as usize;
        let fin_jump = cur.read_short() as usize;

        let thread = self.thread();
        if thread.handlers.len() >= thread.handler_limit {
            return Err(VmError::HandlerOverflow);
        }
        let handler = ExceptionHandler {
            frame_count: thread.frames.len(),
            stack_top: cur.slots + depth,
            except_ip: flags
                .contains(TryFlags::HAS_EXCEPT)
                .then_some(cur.ip + ex_jump),
            finally_ip: flags
                .contains(TryFlags::HAS_FINALLY)
                .then_some(cur.ip + fin_jump),
            in_except: false,
        };
        self.thread_mut().handlers.push(handler);
        Ok(())
    }

    pub(crate) fn op_end_try(&mut self) {
        self.thread_mut().handlers.pop();
    }

    /// Falls through when no exception is pending; otherwise resumes
    /// unwinding so the exception continues outward past the finally.
    pub(crate) fn op_end_finally(&mut self) -> VmResult<()> {
        if self.thread().exception.is_some() {
            Err(VmError::Exception)
        } else {
            Ok(())
        }
    }

    pub(crate) fn op_throw(&mut self) -> VmResult<Flow> {
        let value = self.pop();
        let thread = self.thread_mut();
        thread.exception = Some(value);
        thread.last_error = value;
        Err(VmError::Exception)
    }

    /// The unwinder. Pops frames back to the innermost live handler and
    /// redirects the cursor into its except or finally block. Returns
    /// false when nothing handled the exception; the thread has then been
    /// reported and reset.
    pub(crate) fn handle_exception(&mut self, cur: &mut Cursor) -> bool {
        if self.thread().exception.is_none() {
            return false;
        }
        loop {
            let Some(handler) = self.thread().handlers.last().cloned() else {
                break;
            };

            while self.thread().frames.len() > handler.frame_count {
                let frame = match self.thread().frames.last() {
                    Some(frame) => frame.clone(),
                    None => break,
                };
                self.close_upvalues(frame.slots);
                self.restore_module_context(&frame);
                let thread = self.thread_mut();
                let frame_index = thread.frames.len() - 1;
                thread
                    .pending_set_locals
                    .retain(|&(index, _)| index < frame_index);
                thread.frames.pop();
            }

            if self.thread().frames.is_empty() {
                self.report_exception();
                self.reset_current_thread();
                return false;
            }

            if self.reload_into(cur).is_err() {
                break;
            }
            self.thread_mut().set_top(handler.stack_top);

            if let Some(except_ip) = handler.except_ip {
                if !handler.in_except {
                    if let Some(live) = self.thread_mut().handlers.last_mut() {
                        live.in_except = true;
                    }
                    cur.ip = except_ip;
                    let exception = self.thread_mut().exception.take().unwrap_or(Value::Nil);
                    self.push(exception);
                    return true;
                }
            }

            if let Some(finally_ip) = handler.finally_ip {
                self.thread_mut().handlers.pop();
                cur.ip = finally_ip;
                return true;
            }

            self.thread_mut().handlers.pop();
        }

        self.report_exception();
        self.reset_current_thread();
        false
    }

    /// Formats the pending exception and a traceback to stderr.
    pub(crate) fn report_exception(&mut self) {
        let Some(exception) = self.thread().exception else {
            return;
        };
        match exception {
            Value::Str(id) => {
                eprintln!("Error: {}", self.heap.string(id).chars);
            }
            Value::Table(table) => {
                let type_text = match self.heap.table_get(table, self.names.type_key) {
                    Some(Value::Str(id)) => self.heap.string(id).chars.clone(),
                    _ => "Error".to_string(),
                };
                let msg_text = match self.heap.table_get(table, self.names.msg_key) {
                    Some(Value::Str(id)) => self.heap.string(id).chars.clone(),
                    _ => "<exception>".to_string(),
                };
                eprintln!("{type_text}: {msg_text}");
            }
            _ => eprintln!("Error: <exception>"),
        }

        let thread = self.thread();
        for frame in thread.frames.iter().rev() {
            let instruction = frame.ip.saturating_sub(1);
            let line = frame.chunk.line_at(instruction);
            let function_id = self.heap.closure(frame.closure).function;
            match self.heap.function(function_id).name {
                Some(name) => {
                    eprintln!("[line {line}] in {}()", self.heap.string(name).chars);
                }
                None => eprintln!("[line {line}] in script"),
            }
        }
    }
}
