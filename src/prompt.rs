use std::io::{self, BufRead, Write};

use crate::error::AppError;

/// メニューとの対話。テストでは台本どおりに答える実装に差し替える。
pub trait Prompter {
    fn ask(&mut self, question: &str) -> Result<String, AppError>;

    fn confirm(&mut self, question: &str) -> Result<bool, AppError> {
        let answer = self.ask(&format!("{} [y/N]", question))?;
        Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
    }

    /// 検証のスキップや未完了送信など、危険な操作の確認。`--yes` でも自動承認しない。
    fn confirm_override(&mut self, question: &str) -> Result<bool, AppError> {
        self.confirm(question)
    }

    fn secret(&mut self, question: &str) -> Result<String, AppError> {
        self.ask(question)
    }
}

pub struct StdinPrompter {
    assume_yes: bool,
}

impl StdinPrompter {
    pub fn new(assume_yes: bool) -> Self {
        StdinPrompter { assume_yes }
    }

    fn read_line(&self, question: &str) -> Result<String, AppError> {
        print!("{} ", question);
        io::stdout().flush()?;
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Err(AppError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "入力が終了しました")));
        }
        Ok(line.trim().to_string())
    }
}

impl Prompter for StdinPrompter {
    fn ask(&mut self, question: &str) -> Result<String, AppError> {
        self.read_line(question)
    }

    fn confirm(&mut self, question: &str) -> Result<bool, AppError> {
        if self.assume_yes {
            println!("{} [y/N] y", question);
            return Ok(true);
        }
        let answer = self.read_line(&format!("{} [y/N]", question))?;
        Ok(matches!(answer.to_lowercase().as_str(), "y" | "yes"))
    }

    fn confirm_override(&mut self, question: &str) -> Result<bool, AppError> {
        let answer = self.read_line(&format!("{} [y/N]", question))?;
        Ok(matches!(answer.to_lowercase().as_str(), "y" | "yes"))
    }
}

/// 入力終了 (EOF) かどうか
pub fn is_end_of_input(err: &AppError) -> bool {
    matches!(err, AppError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
}

#[cfg(test)]
pub struct ScriptedPrompter {
    answers: std::collections::VecDeque<String>,
    pub questions: Vec<String>,
}

#[cfg(test)]
impl ScriptedPrompter {
    pub fn new(answers: &[&str]) -> Self {
        ScriptedPrompter {
            answers: answers.iter().map(|a| a.to_string()).collect(),
            questions: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.answers.len()
    }
}

#[cfg(test)]
impl Prompter for ScriptedPrompter {
    fn ask(&mut self, question: &str) -> Result<String, AppError> {
        self.questions.push(question.to_string());
        self.answers
            .pop_front()
            .ok_or_else(|| AppError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "台本の回答がありません")))
    }
}
